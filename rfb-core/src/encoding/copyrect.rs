//! CopyRect encoding (1): copy an existing region of the framebuffer.

use bytes::Buf;

use super::{BodyScan, Codec, DecodeContext};
use crate::error::DecodeError;
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{PixelFormat, Rect};

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyRectCodec;

impl Codec for CopyRectCodec {
    fn name(&self) -> &'static str {
        "copyrect"
    }

    fn encodings(&self) -> &'static [i32] {
        &[encodings::COPY_RECT]
    }

    fn body_len(
        &self,
        _: &[u8],
        _: &Rect,
        _: &PixelFormat,
        _: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError> {
        Ok(Some(4))
    }

    fn decode(
        &self,
        body: &[u8],
        rect: Rect,
        _ctx: &mut DecodeContext,
        framebuffer: &mut Framebuffer,
    ) -> Result<(), DecodeError> {
        let mut r = body;
        let (Ok(src_x), Ok(src_y)) = (r.try_get_u16(), r.try_get_u16()) else {
            return Err(DecodeError::Truncated("copyrect source"));
        };
        framebuffer.copy_rect(src_x, src_y, rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramebufferSource;
    use crate::types::FrameSize;

    #[test]
    fn copies_region() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(4, 4)).unwrap();
        fb.fill_rect(Rect::new(0, 0, 2, 2), [9, 8, 7, 6]).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());

        CopyRectCodec
            .decode(&[0, 0, 0, 0], Rect::new(2, 2, 2, 2), &mut ctx, &mut fb)
            .unwrap();
        assert_eq!(fb.pixel(3, 3), Some([9, 8, 7, 6]));
        assert_eq!(fb.pixel(2, 1), Some([0; 4]));
    }

    #[test]
    fn source_outside_framebuffer() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(4, 4)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let err = CopyRectCodec
            .decode(&[0, 3, 0, 0], Rect::new(0, 0, 2, 2), &mut ctx, &mut fb)
            .unwrap_err();
        assert!(matches!(err, DecodeError::OutOfBounds(_)));
        assert!(
            CopyRectCodec
                .decode(&[0, 3], Rect::new(0, 0, 1, 1), &mut ctx, &mut fb)
                .is_err()
        );
    }
}
