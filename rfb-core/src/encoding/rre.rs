//! RRE encoding (2): a background colour and a list of solid subrectangles.
//!
//! ```text
//! u32 count | pixel background | count * (pixel colour | u16 x, y, w, h)
//! ```

use bytes::Buf;

use super::{BodyScan, Codec, DecodeContext, sub_rect, take};
use crate::error::DecodeError;
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{PixelFormat, Rect};

#[derive(Debug, Default, Clone, Copy)]
pub struct RreCodec;

impl Codec for RreCodec {
    fn name(&self) -> &'static str {
        "rre"
    }

    fn encodings(&self) -> &'static [i32] {
        &[encodings::RRE]
    }

    fn body_len(
        &self,
        mut src: &[u8],
        _rect: &Rect,
        pixel_format: &PixelFormat,
        _scan: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError> {
        let Ok(count) = src.try_get_u32() else {
            return Ok(None);
        };
        let bpp = pixel_format.bytes_per_pixel() as u64;
        let total = 4 + bpp + count as u64 * (bpp + 8);
        usize::try_from(total)
            .map(Some)
            .map_err(|_| DecodeError::Invalid("rre subrectangle count"))
    }

    fn decode(
        &self,
        body: &[u8],
        rect: Rect,
        ctx: &mut DecodeContext,
        framebuffer: &mut Framebuffer,
    ) -> Result<(), DecodeError> {
        let bpp = ctx.pixel_format().bytes_per_pixel();
        let mut r = body;
        let count = r.try_get_u32().map_err(|_| DecodeError::Truncated("rre header"))?;
        let background = take(&mut r, bpp).ok_or(DecodeError::Truncated("rre background"))?;
        framebuffer.fill_rect(rect, ctx.pixel(background)?)?;

        for _ in 0..count {
            let colour = take(&mut r, bpp);
            let geometry = (r.try_get_u16(), r.try_get_u16(), r.try_get_u16(), r.try_get_u16());
            let (Some(colour), (Ok(x), Ok(y), Ok(w), Ok(h))) = (colour, geometry) else {
                return Err(DecodeError::Truncated("rre subrectangle"));
            };
            framebuffer.fill_rect(sub_rect(rect, x, y, w, h)?, ctx.pixel(colour)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramebufferSource;
    use crate::types::FrameSize;

    fn body() -> Vec<u8> {
        let mut b = vec![0, 0, 0, 1];
        b.extend_from_slice(&[1, 1, 1, 0]);
        b.extend_from_slice(&[2, 2, 2, 0]);
        b.extend_from_slice(&[0, 1, 0, 1, 0, 2, 0, 1]);
        b
    }

    #[test]
    fn length_from_header() {
        let pf = PixelFormat::bgra32();
        let rect = Rect::new(0, 0, 4, 4);
        assert_eq!(RreCodec.body_len(&[0, 0], &rect, &pf, &mut BodyScan::default()).unwrap(), None);
        assert_eq!(RreCodec.body_len(&body(), &rect, &pf, &mut BodyScan::default()).unwrap(), Some(20));
    }

    #[test]
    fn paints_background_then_subrects() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(6, 6)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let rect = Rect::new(2, 2, 4, 4);

        RreCodec.decode(&body(), rect, &mut ctx, &mut fb).unwrap();
        assert_eq!(fb.pixel(2, 2), Some([1, 1, 1, 0]));
        assert_eq!(fb.pixel(3, 3), Some([2, 2, 2, 0]));
        assert_eq!(fb.pixel(4, 3), Some([2, 2, 2, 0]));
        assert_eq!(fb.pixel(5, 3), Some([1, 1, 1, 0]));
        assert_eq!(fb.pixel(0, 0), Some([0; 4]));
    }

    #[test]
    fn subrect_past_edge_is_invalid() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(6, 6)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let mut b = body();
        b[12..].copy_from_slice(&[0, 3, 0, 0, 0, 2, 0, 1]);
        let err = RreCodec
            .decode(&b, Rect::new(0, 0, 4, 4), &mut ctx, &mut fb)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }
}
