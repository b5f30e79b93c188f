//! Shared geometry and pixel types.
//!
//! These are the wire-level descriptions negotiated with the server
//! ([`PixelFormat`], [`FrameSize`]) and the region type used by every
//! rectangle of a framebuffer update ([`Rect`]). Decoded pixels are always
//! stored as BGRA 8:8:8:8, see [`crate::framebuffer`].

use std::fmt;

use bytes::{Buf, BufMut};

/// Bytes per pixel of the decoded framebuffer (BGRA).
pub const BYTES_PER_PIXEL: usize = 4;

// ── FrameSize ────────────────────────────────────────────────────

/// Width and height of the remote desktop in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameSize {
    pub width: u16,
    pub height: u16,
}

impl FrameSize {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Whether the frame holds no pixels at all.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels.
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size in bytes of a BGRA buffer of this size.
    pub const fn byte_len(&self) -> usize {
        self.area() * BYTES_PER_PIXEL
    }

    /// The rectangle covering the whole frame.
    pub const fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Whether `rect` lies entirely inside `(0, 0, width, height)`.
    pub fn contains(&self, rect: &Rect) -> bool {
        rect.right() <= self.width as u32 && rect.bottom() <= self.height as u32
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── Rect ─────────────────────────────────────────────────────────

/// A sub-region of the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge. Computed in `u32` so it cannot overflow.
    pub const fn right(&self) -> u32 {
        self.x as u32 + self.width as u32
    }

    /// Exclusive bottom edge.
    pub const fn bottom(&self) -> u32 {
        self.y as u32 + self.height as u32
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether `inner` lies entirely inside this rectangle.
    pub fn encloses(&self, inner: &Rect) -> bool {
        inner.x >= self.x
            && inner.y >= self.y
            && inner.right() <= self.right()
            && inner.bottom() <= self.bottom()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

// ── PixelFormat ──────────────────────────────────────────────────

/// RFB pixel format descriptor, 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    /// Bits per pixel (8, 16 or 32).
    pub bits_per_pixel: u8,
    /// Number of useful bits in each pixel value.
    pub depth: u8,
    /// Multi-byte pixels are sent most significant byte first.
    pub big_endian: bool,
    /// True colour (channel shifts) as opposed to a colour map.
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Encoded size on the wire.
    pub const SIZE: usize = 16;

    /// 32-bit little-endian `0x00RRGGBB`, i.e. B, G, R, X in memory.
    ///
    /// This is the framebuffer's own layout, so raw rectangles in this
    /// format are copied without conversion.
    pub const fn bgra32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// 16-bit RGB 5:6:5, little-endian.
    pub const fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: false,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// 8-bit true colour BGR 2:3:3.
    pub const fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_colour: true,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// 8-bit colour-mapped pixels.
    pub const fn indexed8() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian: false,
            true_colour: false,
            red_max: 0,
            green_max: 0,
            blue_max: 0,
            red_shift: 0,
            green_shift: 0,
            blue_shift: 0,
        }
    }

    /// Bytes consumed by a single pixel on the wire.
    pub const fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }

    /// Whether wire pixels are already in framebuffer (BGRA) layout.
    pub fn is_native(&self) -> bool {
        self.bits_per_pixel == 32
            && self.true_colour
            && !self.big_endian
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
            && self.red_shift == 16
            && self.green_shift == 8
            && self.blue_shift == 0
    }

    /// Check that the format can be represented and converted.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return Err("bits-per-pixel must be 8, 16 or 32");
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return Err("depth must be between 1 and bits-per-pixel");
        }
        if self.true_colour {
            for (max, shift) in [
                (self.red_max, self.red_shift),
                (self.green_max, self.green_shift),
                (self.blue_max, self.blue_shift),
            ] {
                if max == 0 || (max as u32 & (max as u32 + 1)) != 0 {
                    return Err("channel maximum must be 2^n - 1");
                }
                let bits = 16 - max.leading_zeros();
                if shift as u32 + bits > self.bits_per_pixel as u32 {
                    return Err("channel does not fit in the pixel");
                }
            }
        }
        Ok(())
    }

    /// Size of a ZRLE compact pixel (CPIXEL).
    ///
    /// 32-bit true-colour formats whose channels fit in the least or most
    /// significant three bytes are sent as three bytes.
    pub fn compact_pixel_size(&self) -> usize {
        if self.compact_pixel_layout().is_some() {
            3
        } else {
            self.bytes_per_pixel()
        }
    }

    /// `Some(true)` when the colour bits occupy the low three bytes,
    /// `Some(false)` for the high three bytes, `None` when no CPIXEL applies.
    fn compact_pixel_layout(&self) -> Option<bool> {
        if self.bits_per_pixel != 32 || self.depth > 24 || !self.true_colour {
            return None;
        }
        let place = |max: u16, shift: u8| u32::from(max).checked_shl(u32::from(shift)).unwrap_or(0);
        let mask = place(self.red_max, self.red_shift)
            | place(self.green_max, self.green_shift)
            | place(self.blue_max, self.blue_shift);
        if mask & 0xFF00_0000 == 0 {
            Some(true)
        } else if mask & 0x0000_00FF == 0 {
            Some(false)
        } else {
            None
        }
    }

    /// Expand a compact pixel into a full wire pixel.
    pub fn expand_compact(&self, src: &[u8]) -> [u8; 4] {
        match (self.compact_pixel_layout(), self.big_endian) {
            (Some(true), false) | (Some(false), true) => [src[0], src[1], src[2], 0],
            (Some(true), true) | (Some(false), false) => [0, src[0], src[1], src[2]],
            (None, _) => {
                let mut out = [0u8; 4];
                let n = self.bytes_per_pixel().min(src.len());
                out[..n].copy_from_slice(&src[..n]);
                out
            }
        }
    }

    /// Read one pixel value honouring the byte order.
    ///
    /// `None` when `src` is shorter than a pixel or the pixel size is not
    /// 1, 2 or 4 bytes.
    pub fn read_pixel(&self, mut src: &[u8]) -> Option<u32> {
        match (self.bytes_per_pixel(), self.big_endian) {
            (1, _) => src.try_get_u8().ok().map(u32::from),
            (2, false) => src.try_get_u16_le().ok().map(u32::from),
            (2, true) => src.try_get_u16().ok().map(u32::from),
            (4, false) => src.try_get_u32_le().ok(),
            (4, true) => src.try_get_u32().ok(),
            _ => None,
        }
    }

    /// Convert one wire pixel to BGRA.
    ///
    /// Native pixels are copied verbatim, including the fourth byte.
    pub fn to_bgra(&self, src: &[u8], colours: &ColourMap) -> Option<[u8; 4]> {
        if self.is_native() {
            return src.first_chunk::<4>().copied();
        }
        let value = self.read_pixel(src)?;
        if !self.true_colour {
            return Some(colours.bgra(value as usize));
        }
        let channel = |shift: u8, max: u16| {
            scale_channel(value.checked_shr(u32::from(shift)).unwrap_or(0), max)
        };
        Some([
            channel(self.blue_shift, self.blue_max),
            channel(self.green_shift, self.green_max),
            channel(self.red_shift, self.red_max),
            0xFF,
        ])
    }

    /// Serialize to the 16-byte wire format.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.bits_per_pixel);
        dst.put_u8(self.depth);
        dst.put_u8(self.big_endian as u8);
        dst.put_u8(self.true_colour as u8);
        dst.put_u16(self.red_max);
        dst.put_u16(self.green_max);
        dst.put_u16(self.blue_max);
        dst.put_u8(self.red_shift);
        dst.put_u8(self.green_shift);
        dst.put_u8(self.blue_shift);
        dst.put_bytes(0, 3);
    }

    /// Deserialize from the 16-byte wire format.
    ///
    /// The caller guarantees [`Self::SIZE`] bytes are available.
    pub fn decode<B: Buf>(src: &mut B) -> Self {
        let pf = Self {
            bits_per_pixel: src.get_u8(),
            depth: src.get_u8(),
            big_endian: src.get_u8() != 0,
            true_colour: src.get_u8() != 0,
            red_max: src.get_u16(),
            green_max: src.get_u16(),
            blue_max: src.get_u16(),
            red_shift: src.get_u8(),
            green_shift: src.get_u8(),
            blue_shift: src.get_u8(),
        };
        src.advance(3);
        pf
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::bgra32()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.true_colour {
            write!(
                f,
                "{}bpp depth {} r{}<<{} g{}<<{} b{}<<{} {}",
                self.bits_per_pixel,
                self.depth,
                self.red_max,
                self.red_shift,
                self.green_max,
                self.green_shift,
                self.blue_max,
                self.blue_shift,
                if self.big_endian { "BE" } else { "LE" }
            )
        } else {
            write!(f, "{}bpp colour-mapped", self.bits_per_pixel)
        }
    }
}

fn scale_channel(value: u32, max: u16) -> u8 {
    let max = max as u32;
    if max == 0 {
        return 0;
    }
    let v = value & max;
    if max == 255 {
        v as u8
    } else {
        ((v * 255 + max / 2) / max) as u8
    }
}

// ── ColourMap ────────────────────────────────────────────────────

/// Palette used when the pixel format is not true colour.
///
/// Entries arrive through `SetColourMapEntries` as 16-bit channels and
/// are stored pre-converted to BGRA.
#[derive(Debug, Clone, Default)]
pub struct ColourMap {
    entries: Vec<[u8; 4]>,
}

impl ColourMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `colours` (red, green, blue as 16-bit values) from index `first`.
    pub fn set_entries(&mut self, first: u16, colours: &[[u16; 3]]) {
        let end = first as usize + colours.len();
        if self.entries.len() < end {
            self.entries.resize(end, [0, 0, 0, 0xFF]);
        }
        for (slot, [r, g, b]) in self.entries[first as usize..end].iter_mut().zip(colours) {
            *slot = [(b >> 8) as u8, (g >> 8) as u8, (r >> 8) as u8, 0xFF];
        }
    }

    /// BGRA for `index`; unset entries are opaque black.
    pub fn bgra(&self, index: usize) -> [u8; 4] {
        self.entries.get(index).copied().unwrap_or([0, 0, 0, 0xFF])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────
