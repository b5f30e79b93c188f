//! Rectangle encodings.
//!
//! A [`Codec`] turns the byte span of one rectangle into BGRA pixels in the
//! framebuffer. Codecs hold no per-connection state: anything that must
//! survive between rectangles (the ZRLE zlib stream, the colour map) lives
//! in the [`DecodeContext`] owned by the connection's receiver.
//!
//! The [`EncodingRegistry`] maps encoding ids to codecs. It is filled once
//! during setup and then shared read-only through an `Arc`.

pub mod copyrect;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod zrle;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use flate2::Decompress;
use tracing::debug;

use crate::error::{DecodeError, RfbError};
use crate::framebuffer::Framebuffer;
use crate::protocol::encodings;
use crate::types::{BYTES_PER_PIXEL, ColourMap, PixelFormat, Rect};

pub use copyrect::CopyRectCodec;
pub use hextile::HextileCodec;
pub use raw::RawCodec;
pub use rre::RreCodec;
pub use zrle::ZrleCodec;

// ── Codec ────────────────────────────────────────────────────────

/// Decoder for one or more encoding ids.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Encoding ids this codec decodes.
    fn encodings(&self) -> &'static [i32];

    /// Length of the rectangle body at the start of `src`.
    ///
    /// Returns `Ok(None)` when `src` is too short to tell. Must not assume
    /// anything beyond `src` has been received. Calls for the same
    /// rectangle see a growing `src` and the same `scan`, which starts out
    /// zeroed; codecs that walk the body may record their progress in it.
    fn body_len(
        &self,
        src: &[u8],
        rect: &Rect,
        pixel_format: &PixelFormat,
        scan: &mut BodyScan,
    ) -> Result<Option<usize>, DecodeError>;

    /// Decode exactly `body` into `framebuffer` at `rect`.
    fn decode(
        &self,
        body: &[u8],
        rect: Rect,
        ctx: &mut DecodeContext,
        framebuffer: &mut Framebuffer,
    ) -> Result<(), DecodeError>;
}

/// Progress of a partial [`Codec::body_len`] walk over one rectangle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BodyScan {
    /// Bytes known to belong to the body.
    pub offset: usize,
    /// Codec-defined units (tiles, subrectangles) covered by `offset`.
    pub units: usize,
}

// ── DecodeContext ────────────────────────────────────────────────

/// Per-connection state shared by all codecs.
pub struct DecodeContext {
    pixel_format: PixelFormat,
    colours: ColourMap,
    zlib: Decompress,
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("pixel_format", &self.pixel_format)
            .field("colours", &self.colours.len())
            .field("zlib_total_in", &self.zlib.total_in())
            .finish()
    }
}

impl DecodeContext {
    pub fn new(pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            colours: ColourMap::new(),
            zlib: Decompress::new(true),
        }
    }

    pub fn pixel_format(&self) -> &PixelFormat {
        &self.pixel_format
    }

    /// Switch to a newly requested pixel format. The colour map and the
    /// zlib stream are kept.
    pub fn set_pixel_format(&mut self, pixel_format: PixelFormat) {
        self.pixel_format = pixel_format;
    }

    pub fn colours(&self) -> &ColourMap {
        &self.colours
    }

    pub fn colours_mut(&mut self) -> &mut ColourMap {
        &mut self.colours
    }

    /// The ZRLE inflater; one stream for the lifetime of the connection.
    pub fn zlib_mut(&mut self) -> &mut Decompress {
        &mut self.zlib
    }

    /// Convert one wire pixel to BGRA.
    pub fn pixel(&self, src: &[u8]) -> Result<[u8; 4], DecodeError> {
        self.pixel_format
            .to_bgra(src, &self.colours)
            .ok_or(DecodeError::Truncated("pixel"))
    }

    /// Convert `count` packed wire pixels to BGRA.
    pub fn convert(&self, src: &[u8], count: usize) -> Result<Vec<u8>, DecodeError> {
        let bpp = self.pixel_format.bytes_per_pixel();
        if bpp == 0 {
            return Err(DecodeError::UnsupportedPixelFormat(self.pixel_format.to_string()));
        }
        let needed = count * bpp;
        if src.len() < needed {
            return Err(DecodeError::Truncated("pixel data"));
        }
        if self.pixel_format.is_native() {
            return Ok(src[..needed].to_vec());
        }
        let mut out = Vec::with_capacity(count * BYTES_PER_PIXEL);
        for px in src[..needed].chunks_exact(bpp) {
            out.extend_from_slice(&self.pixel(px)?);
        }
        Ok(out)
    }
}

// ── EncodingRegistry ─────────────────────────────────────────────

/// Encoding id to codec lookup.
#[derive(Debug, Default)]
pub struct EncodingRegistry {
    codecs: HashMap<i32, Arc<dyn Codec>>,
    order: Vec<i32>,
}

impl EncodingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in codecs, most preferred first: ZRLE, Hextile, RRE,
    /// CopyRect, Raw.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let builtins: [Arc<dyn Codec>; 5] = [
            Arc::new(ZrleCodec),
            Arc::new(HextileCodec),
            Arc::new(RreCodec),
            Arc::new(CopyRectCodec),
            Arc::new(RawCodec),
        ];
        for codec in builtins {
            // Built-in ids are distinct.
            let _ = registry.register_codec(codec);
        }
        registry
    }

    /// Register `codec` for `id`.
    ///
    /// Fails with [`RfbError::DuplicateEncoding`] when `id` is taken and
    /// with [`RfbError::InvalidArgument`] for ids the engine handles itself.
    pub fn register(&mut self, id: i32, codec: Arc<dyn Codec>) -> Result<(), RfbError> {
        if encodings::is_pseudo(id) {
            return Err(RfbError::InvalidArgument(format!(
                "encoding {id} is a pseudo-encoding handled by the receiver"
            )));
        }
        if self.codecs.contains_key(&id) {
            return Err(RfbError::DuplicateEncoding(id));
        }
        debug!(encoding = id, codec = codec.name(), "registered codec");
        self.codecs.insert(id, codec);
        self.order.push(id);
        Ok(())
    }

    /// Register `codec` for every id it claims. Nothing is registered if
    /// any id is already taken.
    pub fn register_codec(&mut self, codec: Arc<dyn Codec>) -> Result<(), RfbError> {
        if let Some(&taken) = codec
            .encodings()
            .iter()
            .find(|id| self.codecs.contains_key(id))
        {
            return Err(RfbError::DuplicateEncoding(taken));
        }
        for &id in codec.encodings() {
            self.register(id, Arc::clone(&codec))?;
        }
        Ok(())
    }

    pub fn lookup(&self, id: i32) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(&id)
    }

    /// Registered ids in priority order.
    pub fn encodings(&self) -> &[i32] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Split `n` bytes off the front of `src`, or `None` if fewer remain.
pub(crate) fn take<'a>(src: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    let (head, rest) = src.split_at_checked(n)?;
    *src = rest;
    Some(head)
}

/// Translate a sub-rectangle relative to `outer` into framebuffer coordinates.
pub(crate) fn sub_rect(outer: Rect, x: u16, y: u16, w: u16, h: u16) -> Result<Rect, DecodeError> {
    let inner = Rect::new(0, 0, outer.width, outer.height);
    let local = Rect::new(x, y, w, h);
    if !inner.encloses(&local) {
        return Err(DecodeError::Invalid("subrectangle outside its rectangle"));
    }
    Ok(Rect::new(outer.x + x, outer.y + y, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[derive(Debug)]
    struct Dummy;

    impl Codec for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }
        fn encodings(&self) -> &'static [i32] {
            &[0, 77]
        }
        fn body_len(
            &self,
            _: &[u8],
            _: &Rect,
            _: &PixelFormat,
            _: &mut BodyScan,
        ) -> Result<Option<usize>, DecodeError> {
            Ok(Some(0))
        }
        fn decode(
            &self,
            _: &[u8],
            _: Rect,
            _: &mut DecodeContext,
            _: &mut Framebuffer,
        ) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[test]
    fn defaults_priority_order() {
        let registry = EncodingRegistry::with_defaults();
        assert_eq!(registry.encodings(), &[16, 5, 2, 1, 0]);
        assert_eq!(registry.lookup(5).unwrap().name(), "hextile");
        assert!(registry.lookup(-9999).is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = EncodingRegistry::with_defaults();
        let err = registry.register(0, Arc::new(Dummy)).unwrap_err();
        assert!(matches!(err, RfbError::DuplicateEncoding(0)));
        assert_eq!(registry.lookup(0).unwrap().name(), "raw");
    }

    #[test]
    fn register_codec_is_all_or_nothing() {
        let mut registry = EncodingRegistry::with_defaults();
        assert!(registry.register_codec(Arc::new(Dummy)).is_err());
        assert!(registry.lookup(77).is_none());

        let mut empty = EncodingRegistry::new();
        empty.register_codec(Arc::new(Dummy)).unwrap();
        assert_eq!(empty.encodings(), &[0, 77]);
    }

    #[test]
    fn pseudo_ids_reserved() {
        let mut registry = EncodingRegistry::new();
        assert!(registry.register(encodings::DESKTOP_SIZE, Arc::new(Dummy)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn take_stops_at_end() {
        let mut r: &[u8] = &[0, 1, 0, 0, 0, 2, 9];
        assert_eq!(r.try_get_u16().ok(), Some(1));
        assert_eq!(r.try_get_u32().ok(), Some(2));
        assert_eq!(take(&mut r, 2), None);
        assert_eq!(take(&mut r, 1), Some(&[9][..]));
        assert!(r.try_get_u8().is_err());
    }

    #[test]
    fn sub_rect_bounds() {
        let outer = Rect::new(10, 10, 4, 4);
        assert_eq!(sub_rect(outer, 1, 1, 3, 3).unwrap(), Rect::new(11, 11, 3, 3));
        assert!(sub_rect(outer, 1, 1, 4, 3).is_err());
    }

    #[test]
    fn convert_rgb565() {
        let ctx = DecodeContext::new(PixelFormat::rgb565());
        let out = ctx.convert(&[0x00, 0xF8, 0x1F, 0x00], 2).unwrap();
        assert_eq!(out, vec![0, 0, 255, 255, 255, 0, 0, 255]);
        assert!(ctx.convert(&[0x00], 1).is_err());
    }
}
