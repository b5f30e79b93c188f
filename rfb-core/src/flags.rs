//! Pointer button state carried by `PointerEvent`.

use bitflags::bitflags;

bitflags! {
    /// Buttons held down during a pointer event.
    ///
    /// Bits 0..=2 are the physical buttons, 3..=6 the scroll wheel
    /// directions. A wheel "click" is a press followed by a release.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ButtonMask: u8 {
        const LEFT = 0x01;
        const MIDDLE = 0x02;
        const RIGHT = 0x04;
        const WHEEL_UP = 0x08;
        const WHEEL_DOWN = 0x10;
        const WHEEL_LEFT = 0x20;
        const WHEEL_RIGHT = 0x40;
        const BUTTON8 = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_bits() {
        let mask = ButtonMask::LEFT | ButtonMask::RIGHT;
        assert_eq!(mask.bits(), 0x05);
        assert!(mask.contains(ButtonMask::LEFT));
        assert!(!mask.contains(ButtonMask::MIDDLE));
    }

    #[test]
    fn every_byte_is_representable() {
        assert_eq!(ButtonMask::from_bits_truncate(0xFF), ButtonMask::all());
        assert_eq!(ButtonMask::default().bits(), 0);
    }
}
