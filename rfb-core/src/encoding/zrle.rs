//! ZRLE encoding (16).
//!
//! ```text
//! u32 length | zlib data
//! ```
//!
//! The zlib data continues a single stream for the whole connection, so the
//! inflater lives in [`DecodeContext`]. Once inflated, the rectangle is a
//! sequence of 64x64 tiles, each starting with a subencoding byte:
//!
//! | subencoding | tile contents                                  |
//! |-------------|------------------------------------------------|
//! | 0           | raw compact pixels                             |
//! | 1           | one compact pixel filling the tile             |
//! | 2..=16      | palette + packed 1/2/4-bit indices per row     |
//! | 128         | plain RLE: (pixel, run length)*                |
//! | 130..=255   | palette + RLE over palette indices             |
//!
//! Inflated data is capped at the largest tile stream the rectangle could
//! need and must be used up exactly by its tiles.

use bytes::Buf;
use flate2::{FlushDecompress, Status};
use tracing::trace;

use super::{BodyScan, Codec, DecodeContext, take};
use crate::error::DecodeError;
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{BYTES_PER_PIXEL, PixelFormat, Rect};

const TILE: u16 = 64;

/// Output chunk used while inflating.
const INFLATE_CHUNK: usize = 64 * 1024;

/// Largest palette, in the palette RLE subencodings.
const MAX_PALETTE: usize = 127;

#[derive(Debug, Default, Clone, Copy)]
pub struct ZrleCodec;

impl Codec for ZrleCodec {
    fn name(&self) -> &'static str {
        "zrle"
    }

    fn encodings(&self) -> &'static [i32] {
        &[encodings::ZRLE]
    }

    fn body_len(
        &self,
        mut src: &[u8],
        _: &Rect,
        _: &PixelFormat,
        _: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError> {
        Ok(src.try_get_u32().ok().map(|len| 4 + len as usize))
    }

    fn decode(
        &self,
        body: &[u8],
        rect: Rect,
        ctx: &mut DecodeContext,
        framebuffer: &mut Framebuffer,
    ) -> Result<(), DecodeError> {
        let mut r = body;
        let len = r
            .try_get_u32()
            .map_err(|_| DecodeError::Truncated("zrle length"))? as usize;
        let compressed = take(&mut r, len).ok_or(DecodeError::Truncated("zrle data"))?;
        let limit = max_tile_stream(rect, ctx.pixel_format().compact_pixel_size());
        let data = inflate(ctx, compressed, limit)?;
        trace!(compressed = len, inflated = data.len(), rect = %rect, "zrle rectangle");

        let mut tiles = &data[..];
        for ty in (0..rect.height).step_by(TILE as usize) {
            for tx in (0..rect.width).step_by(TILE as usize) {
                let tile = Rect::new(
                    rect.x.saturating_add(tx),
                    rect.y.saturating_add(ty),
                    TILE.min(rect.width - tx),
                    TILE.min(rect.height - ty),
                );
                let pixels = decode_tile(&mut tiles, tile, ctx)?;
                framebuffer.put_pixels(tile, &pixels)?;
            }
        }
        if !tiles.is_empty() {
            return Err(DecodeError::Invalid("trailing zrle tile data"));
        }
        Ok(())
    }
}

/// Upper bound on the inflated size of `rect`.
///
/// Per tile: the subencoding byte, a full palette, and two bytes plus one
/// compact pixel per pixel. That covers raw, packed palette, plain RLE with
/// runs of one and palette RLE with explicit runs of one.
fn max_tile_stream(rect: Rect, cpixel: usize) -> usize {
    let tiles = usize::from(rect.width.div_ceil(TILE)) * usize::from(rect.height.div_ceil(TILE));
    let per_tile = 1 + MAX_PALETTE * cpixel;
    tiles
        .saturating_mul(per_tile)
        .saturating_add(rect.area().saturating_mul(cpixel + 2))
}

/// Inflate one rectangle's worth of the connection's zlib stream, failing
/// once more than `limit` bytes come out.
fn inflate(ctx: &mut DecodeContext, compressed: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    const OVERFLOW: DecodeError = DecodeError::Invalid("zrle data exceeds its rectangle");

    let zlib = ctx.zlib_mut();
    let ceiling = limit.saturating_add(1);
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(4).min(ceiling));
    let mut consumed = 0usize;

    loop {
        if out.len() > limit {
            return Err(OVERFLOW);
        }
        let room = (ceiling - out.len()).min(INFLATE_CHUNK);
        if out.capacity() - out.len() < room {
            out.reserve_exact(room);
        }
        let before_in = zlib.total_in();
        let before_out = zlib.total_out();
        let status = zlib
            .decompress_vec(&compressed[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| DecodeError::Zlib(e.to_string()))?;
        let taken = (zlib.total_in() - before_in) as usize;
        let produced = zlib.total_out() - before_out;
        consumed += taken;
        let drained = consumed >= compressed.len();

        match status {
            Status::StreamEnd => break,
            _ if drained && out.len() < out.capacity() => break,
            _ if taken == 0 && produced == 0 => {
                if drained {
                    break;
                }
                return Err(DecodeError::Zlib("inflater made no progress".into()));
            }
            _ => {}
        }
    }
    if out.len() > limit {
        return Err(OVERFLOW);
    }
    Ok(out)
}

/// Decode one tile into packed BGRA.
fn decode_tile(r: &mut &[u8], tile: Rect, ctx: &DecodeContext) -> Result<Vec<u8>, DecodeError> {
    let pf = ctx.pixel_format();
    let cpixel = pf.compact_pixel_size();
    let area = tile.area();
    let read_pixel = |r: &mut &[u8]| -> Result<[u8; 4], DecodeError> {
        let src = take(r, cpixel).ok_or(DecodeError::Truncated("zrle pixel"))?;
        ctx.pixel(&pf.expand_compact(src))
    };

    let mode = r
        .try_get_u8()
        .map_err(|_| DecodeError::Truncated("zrle subencoding"))?;
    let mut out = Vec::with_capacity(area * BYTES_PER_PIXEL);
    match mode {
        0 => {
            for _ in 0..area {
                out.extend_from_slice(&read_pixel(r)?);
            }
        }
        1 => {
            let px = read_pixel(r)?;
            for _ in 0..area {
                out.extend_from_slice(&px);
            }
        }
        2..=16 => {
            let palette = (0..mode)
                .map(|_| read_pixel(r))
                .collect::<Result<Vec<_>, _>>()?;
            let bits = match mode {
                2 => 1,
                3..=4 => 2,
                _ => 4,
            };
            let row_bytes = (tile.width as usize * bits).div_ceil(8);
            for _ in 0..tile.height {
                let row = take(r, row_bytes).ok_or(DecodeError::Truncated("zrle packed row"))?;
                for x in 0..tile.width as usize {
                    let bit = x * bits;
                    let shift = 8 - bits - bit % 8;
                    let index = (row[bit / 8] >> shift) as usize & ((1 << bits) - 1);
                    let px = palette
                        .get(index)
                        .ok_or(DecodeError::Invalid("zrle palette index"))?;
                    out.extend_from_slice(px);
                }
            }
        }
        128 => {
            while out.len() < area * BYTES_PER_PIXEL {
                let px = read_pixel(r)?;
                let run = run_length(r)?;
                push_run(&mut out, px, run, area)?;
            }
        }
        130..=255 => {
            let palette = (0..mode - 128)
                .map(|_| read_pixel(r))
                .collect::<Result<Vec<_>, _>>()?;
            while out.len() < area * BYTES_PER_PIXEL {
                let code = r
                    .try_get_u8()
                    .map_err(|_| DecodeError::Truncated("zrle palette rle"))?;
                let px = *palette
                    .get((code & 0x7F) as usize)
                    .ok_or(DecodeError::Invalid("zrle palette index"))?;
                let run = if code & 0x80 != 0 { run_length(r)? } else { 1 };
                push_run(&mut out, px, run, area)?;
            }
        }
        _ => return Err(DecodeError::Invalid("zrle subencoding")),
    }
    Ok(out)
}

/// Run length: 1 plus the sum of bytes up to and including the first non-255.
fn run_length(r: &mut &[u8]) -> Result<usize, DecodeError> {
    let mut run = 1usize;
    loop {
        let b = r
            .try_get_u8()
            .map_err(|_| DecodeError::Truncated("zrle run length"))?;
        run += b as usize;
        if b != 255 {
            return Ok(run);
        }
    }
}

fn push_run(out: &mut Vec<u8>, px: [u8; 4], run: usize, area: usize) -> Result<(), DecodeError> {
    if out.len() / BYTES_PER_PIXEL + run > area {
        return Err(DecodeError::Invalid("zrle run past end of tile"));
    }
    for _ in 0..run {
        out.extend_from_slice(&px);
    }
    Ok(())
}
