//! Raw encoding (0): `width * height` pixels, row-major.

use super::{BodyScan, Codec, DecodeContext};
use crate::error::DecodeError;
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{PixelFormat, Rect};

#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encodings(&self) -> &'static [i32] {
        &[encodings::RAW]
    }

    fn body_len(
        &self,
        _src: &[u8],
        rect: &Rect,
        pixel_format: &PixelFormat,
        _scan: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError> {
        Ok(Some(rect.area() * pixel_format.bytes_per_pixel()))
    }

    fn decode(
        &self,
        body: &[u8],
        rect: Rect,
        ctx: &mut DecodeContext,
        framebuffer: &mut Framebuffer,
    ) -> Result<(), DecodeError> {
        if ctx.pixel_format().is_native() {
            return framebuffer.put_pixels(rect, body);
        }
        let pixels = ctx.convert(body, rect.area())?;
        framebuffer.put_pixels(rect, &pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramebufferSource;
    use crate::types::FrameSize;

    #[test]
    fn native_bytes_land_verbatim() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(4, 4)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let body: Vec<u8> = (0..64).collect();
        let rect = Rect::new(0, 0, 4, 4);

        assert_eq!(
            RawCodec.body_len(&[], &rect, ctx.pixel_format(), &mut BodyScan::default()).unwrap(),
            Some(64)
        );
        RawCodec.decode(&body, rect, &mut ctx, &mut fb).unwrap();
        assert_eq!(fb.data(), &body[..]);
    }

    #[test]
    fn decoding_twice_is_identical() {
        let body: Vec<u8> = (0..8u8).map(|b| b.wrapping_mul(37)).collect();
        let rect = Rect::new(1, 0, 2, 2);
        let decode_once = || {
            let source = FramebufferSource::new();
            let mut fb = source.acquire_blocking(FrameSize::new(3, 2)).unwrap();
            let mut ctx = DecodeContext::new(PixelFormat::rgb565());
            RawCodec.decode(&body, rect, &mut ctx, &mut fb).unwrap();
            fb.data().to_vec()
        };
        assert_eq!(decode_once(), decode_once());
    }

    #[test]
    fn out_of_bounds_rejected() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(2, 2)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let err = RawCodec
            .decode(&[0; 12], Rect::new(0, 0, 3, 1), &mut ctx, &mut fb)
            .unwrap_err();
        assert_eq!(err, DecodeError::OutOfBounds(Rect::new(0, 0, 3, 1)));
    }
}
