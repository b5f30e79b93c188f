//! Hextile encoding (5).
//!
//! The rectangle is split into 16x16 tiles, left to right, top to bottom.
//! Each tile starts with a subencoding mask. Background and foreground
//! colours carry over from tile to tile within one rectangle.

use bytes::Buf;

use super::{BodyScan, Codec, DecodeContext, sub_rect, take};
use crate::error::DecodeError;
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{PixelFormat, Rect};

const TILE: u16 = 16;

const RAW: u8 = 0x01;
const BACKGROUND_SPECIFIED: u8 = 0x02;
const FOREGROUND_SPECIFIED: u8 = 0x04;
const ANY_SUBRECTS: u8 = 0x08;
const SUBRECTS_COLOURED: u8 = 0x10;

const TRUNCATED: DecodeError = DecodeError::Truncated("hextile tile");

#[derive(Debug, Default, Clone, Copy)]
pub struct HextileCodec;

impl Codec for HextileCodec {
    fn name(&self) -> &'static str {
        "hextile"
    }

    fn encodings(&self) -> &'static [i32] {
        &[encodings::HEXTILE]
    }

    /// Resumes after the last complete tile recorded in `scan`, so a body
    /// arriving in many pieces is walked once.
    fn body_len(
        &self,
        src: &[u8],
        rect: &Rect,
        pixel_format: &PixelFormat,
        scan: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError> {
        let bpp = pixel_format.bytes_per_pixel();
        let Some(mut r) = src.get(scan.offset..) else {
            return Ok(None);
        };
        for tile in tiles(*rect, scan.units) {
            if skip_tile(&mut r, tile, bpp).is_none() {
                return Ok(None);
            }
            scan.units += 1;
            scan.offset = src.len() - r.len();
        }
        Ok(Some(scan.offset))
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
        let mut background = [0, 0, 0, 0xFF];
        let mut foreground = [0xFF; 4];

        for tile in tiles(rect, 0) {
            let mask = r.try_get_u8().map_err(|_| TRUNCATED)?;
            if mask & RAW != 0 {
                let pixels = take(&mut r, tile.area() * bpp).ok_or(TRUNCATED)?;
                framebuffer.put_pixels(tile, &ctx.convert(pixels, tile.area())?)?;
                continue;
            }
            if mask & BACKGROUND_SPECIFIED != 0 {
                background = ctx.pixel(take(&mut r, bpp).ok_or(TRUNCATED)?)?;
            }
            if mask & FOREGROUND_SPECIFIED != 0 {
                foreground = ctx.pixel(take(&mut r, bpp).ok_or(TRUNCATED)?)?;
            }
            framebuffer.fill_rect(tile, background)?;

            if mask & ANY_SUBRECTS == 0 {
                continue;
            }
            let count = r.try_get_u8().map_err(|_| TRUNCATED)?;
            for _ in 0..count {
                let fill = if mask & SUBRECTS_COLOURED != 0 {
                    ctx.pixel(take(&mut r, bpp).ok_or(TRUNCATED)?)?
                } else {
                    foreground
                };
                let (Ok(xy), Ok(wh)) = (r.try_get_u8(), r.try_get_u8()) else {
                    return Err(TRUNCATED);
                };
                let area = sub_rect(
                    tile,
                    (xy >> 4) as u16,
                    (xy & 0x0F) as u16,
                    (wh >> 4) as u16 + 1,
                    (wh & 0x0F) as u16 + 1,
                )?;
                framebuffer.fill_rect(area, fill)?;
            }
        }
        Ok(())
    }
}

/// Tiles of `rect` in wire order, starting with tile number `from`.
fn tiles(rect: Rect, from: usize) -> impl Iterator<Item = Rect> {
    let cols = usize::from(rect.width.div_ceil(TILE));
    let rows = usize::from(rect.height.div_ceil(TILE));
    (from..cols * rows).map(move |i| {
        let tx = (i % cols) as u16 * TILE;
        let ty = (i / cols) as u16 * TILE;
        Rect::new(
            rect.x.saturating_add(tx),
            rect.y.saturating_add(ty),
            TILE.min(rect.width - tx),
            TILE.min(rect.height - ty),
        )
    })
}

/// Step over one encoded tile. `None` if `r` ends inside it.
fn skip_tile(r: &mut &[u8], tile: Rect, bpp: usize) -> Option<()> {
    let mask = r.try_get_u8().ok()?;
    if mask & RAW != 0 {
        take(r, tile.area() * bpp)?;
        return Some(());
    }
    if mask & BACKGROUND_SPECIFIED != 0 {
        take(r, bpp)?;
    }
    if mask & FOREGROUND_SPECIFIED != 0 {
        take(r, bpp)?;
    }
    if mask & ANY_SUBRECTS != 0 {
        let count = usize::from(r.try_get_u8().ok()?);
        let each = if mask & SUBRECTS_COLOURED != 0 { bpp + 2 } else { 2 };
        take(r, count * each)?;
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramebufferSource;
    use crate::types::FrameSize;

    const RED: [u8; 4] = [0, 0, 255, 0];
    const BLUE: [u8; 4] = [255, 0, 0, 0];

    /// 20x4 rectangle: two tiles. The first is background + one foreground
    /// subrect, the second reuses the background with no subrects.
    fn body() -> Vec<u8> {
        let mut b = vec![BACKGROUND_SPECIFIED | FOREGROUND_SPECIFIED | ANY_SUBRECTS];
        b.extend_from_slice(&RED);
        b.extend_from_slice(&BLUE);
        b.push(1);
        b.push(0x11); // x=1, y=1
        b.push(0x10); // w=2, h=1
        b.push(0);
        b
    }

    #[test]
    fn scans_tile_lengths() {
        let pf = PixelFormat::bgra32();
        let rect = Rect::new(0, 0, 20, 4);
        let b = body();
        let len = |src: &[u8]| HextileCodec.body_len(src, &rect, &pf, &mut BodyScan::default()).unwrap();
        assert_eq!(len(&b), Some(b.len()));
        assert_eq!(len(&b[..b.len() - 1]), None);
        assert_eq!(len(&b[..5]), None);
    }

    #[test]
    fn scan_resumes_after_complete_tiles() {
        let pf = PixelFormat::bgra32();
        let rect = Rect::new(0, 0, 20, 4);
        let b = body();
        let mut scan = BodyScan::default();

        assert_eq!(HextileCodec.body_len(&b[..5], &rect, &pf, &mut scan).unwrap(), None);
        assert_eq!(scan, BodyScan::default());

        // First tile complete, second still missing.
        let first = b.len() - 1;
        assert_eq!(HextileCodec.body_len(&b[..first], &rect, &pf, &mut scan).unwrap(), None);
        assert_eq!(scan, BodyScan { offset: first, units: 1 });

        // Bytes before the recorded offset are not looked at again.
        let mut garbled = b.clone();
        garbled[0] = RAW;
        assert_eq!(
            HextileCodec.body_len(&garbled, &rect, &pf, &mut scan).unwrap(),
            Some(b.len())
        );
        assert_eq!(scan.units, 2);
    }

    #[test]
    fn paints_tiles() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(20, 4)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        HextileCodec
            .decode(&body(), Rect::new(0, 0, 20, 4), &mut ctx, &mut fb)
            .unwrap();

        assert_eq!(fb.pixel(0, 0), Some(RED));
        assert_eq!(fb.pixel(1, 1), Some(BLUE));
        assert_eq!(fb.pixel(2, 1), Some(BLUE));
        assert_eq!(fb.pixel(3, 1), Some(RED));
        assert_eq!(fb.pixel(19, 3), Some(RED));
    }

    #[test]
    fn raw_tile() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(2, 1)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let b = [RAW, 1, 2, 3, 4, 5, 6, 7, 8];
        let rect = Rect::new(0, 0, 2, 1);
        assert_eq!(
            HextileCodec.body_len(&b, &rect, ctx.pixel_format(), &mut BodyScan::default()).unwrap(),
            Some(9)
        );
        HextileCodec.decode(&b, rect, &mut ctx, &mut fb).unwrap();
        assert_eq!(fb.data(), &b[1..]);
    }

    #[test]
    fn subrect_outside_tile() {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(4, 4)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        let b = [ANY_SUBRECTS, 1, 0x33, 0x11];
        let err = HextileCodec
            .decode(&b, Rect::new(0, 0, 4, 4), &mut ctx, &mut fb)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }
}
