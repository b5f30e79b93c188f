//! Server-to-client message framing.
//!
//! [`ServerMessageDecoder`] is a `tokio_util` [`Decoder`] that turns the
//! inbound byte stream into [`ServerEvent`]s. A framebuffer update becomes
//! `UpdateBegin`, one event per rectangle, then `UpdateEnd`, so the
//! receiver can apply rectangles one at a time and still know where the
//! update ends.
//!
//! Bytes are only consumed once a complete part is buffered: the type byte,
//! an update header, one rectangle with its whole body, or a complete
//! colour-map or cut-text message. Rectangle bounds and the codec lookup are
//! checked from the 12-byte rectangle header, before any body is awaited.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use super::client::latin1_decode;
use super::{ServerMessageType, encodings};
use crate::encoding::{BodyScan, EncodingRegistry};
use crate::error::RfbError;
use crate::types::{FrameSize, PixelFormat, Rect};

/// Largest accepted rectangle body.
pub const MAX_RECT_BODY: usize = 256 * 1024 * 1024;

/// Largest accepted ServerCutText payload.
pub const MAX_CUT_TEXT: usize = 16 * 1024 * 1024;

const RECT_HEADER_LEN: usize = 12;

// ── ReceiverState ────────────────────────────────────────────────

/// Position of the decoder within the inbound message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// At a message boundary.
    AwaitingMessageType,
    /// The type byte was read; the body is pending.
    AwaitingMessageBody(ServerMessageType),
    /// Inside a framebuffer update with `remaining` rectangles to go.
    Dispatching { remaining: u16 },
    /// Terminal. Set after a protocol error.
    Closed,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverState::AwaitingMessageType => write!(f, "AwaitingMessageType"),
            ReceiverState::AwaitingMessageBody(t) => write!(f, "AwaitingMessageBody({t})"),
            ReceiverState::Dispatching { remaining } => write!(f, "Dispatching({remaining})"),
            ReceiverState::Closed => write!(f, "Closed"),
        }
    }
}

// ── ServerEvent ──────────────────────────────────────────────────

/// Header of one rectangle within a framebuffer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub rect: Rect,
    pub encoding: i32,
}

/// One decoded unit of server traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A FramebufferUpdate started; `rectangles` as announced by the server.
    UpdateBegin { rectangles: u16 },
    /// The DesktopSize pseudo-rectangle changed the framebuffer size.
    DesktopSize(FrameSize),
    /// One rectangle and its complete body.
    Rectangle { header: RectHeader, body: Bytes },
    /// Every rectangle of the current update has been delivered.
    UpdateEnd,
    SetColourMapEntries { first: u16, colours: Vec<[u16; 3]> },
    Bell,
    ServerCutText(String),
}

// ── ServerMessageDecoder ─────────────────────────────────────────

/// Frames the server-to-client stream of one connection.
#[derive(Debug)]
pub struct ServerMessageDecoder {
    registry: Arc<EncodingRegistry>,
    state: ReceiverState,
    frame_size: FrameSize,
    pixel_format: PixelFormat,
    /// Body length progress for the rectangle being framed.
    scan: BodyScan,
    max_rect_body: usize,
    max_cut_text: usize,
}

impl ServerMessageDecoder {
    pub fn new(
        registry: Arc<EncodingRegistry>,
        frame_size: FrameSize,
        pixel_format: PixelFormat,
    ) -> Self {
        Self {
            registry,
            state: ReceiverState::AwaitingMessageType,
            frame_size,
            pixel_format,
            scan: BodyScan::default(),
            max_rect_body: MAX_RECT_BODY,
            max_cut_text: MAX_CUT_TEXT,
        }
    }

    /// Override the size guards.
    pub fn with_limits(mut self, max_rect_body: usize, max_cut_text: usize) -> Self {
        self.max_rect_body = max_rect_body;
        self.max_cut_text = max_cut_text;
        self
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Current framebuffer size as tracked from DesktopSize rectangles.
    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    pub fn pixel_format(&self) -> &PixelFormat {
        &self.pixel_format
    }

    /// Use `pixel_format` for rectangles framed from now on.
    pub fn set_pixel_format(&mut self, pixel_format: PixelFormat) {
        self.pixel_format = pixel_format;
    }

    fn fail(&mut self, err: RfbError) -> Result<Option<ServerEvent>, RfbError> {
        debug!(state = %self.state, error = %err, "server stream rejected");
        self.state = ReceiverState::Closed;
        Err(err)
    }

    fn decode_rectangle(
        &mut self,
        src: &mut BytesMut,
        remaining: u16,
    ) -> Result<Option<ServerEvent>, RfbError> {
        if src.len() < RECT_HEADER_LEN {
            src.reserve(RECT_HEADER_LEN - src.len());
            return Ok(None);
        }
        let mut h = &src[..RECT_HEADER_LEN];
        let rect = Rect::new(h.get_u16(), h.get_u16(), h.get_u16(), h.get_u16());
        let encoding = h.get_i32();

        match encoding {
            encodings::LAST_RECT => {
                src.advance(RECT_HEADER_LEN);
                trace!(skipped = remaining - 1, "last rect marker");
                return self.finish_update();
            }
            encodings::DESKTOP_SIZE => {
                src.advance(RECT_HEADER_LEN);
                self.frame_size = FrameSize::new(rect.width, rect.height);
                self.state = ReceiverState::Dispatching {
                    remaining: remaining - 1,
                };
                debug!(size = %self.frame_size, "desktop size changed");
                return Ok(Some(ServerEvent::DesktopSize(self.frame_size)));
            }
            _ => {}
        }

        if !self.frame_size.contains(&rect) {
            return self.fail(RfbError::RectOutOfBounds {
                rect,
                size: self.frame_size,
            });
        }
        let Some(codec) = self.registry.lookup(encoding) else {
            return self.fail(RfbError::UnknownEncoding(encoding));
        };
        let body_len = match codec.body_len(
            &src[RECT_HEADER_LEN..],
            &rect,
            &self.pixel_format,
            &mut self.scan,
        ) {
            Ok(Some(len)) => len,
            Ok(None) if self.scan.offset > self.max_rect_body => {
                return self.fail(RfbError::MessageTooLarge {
                    size: self.scan.offset,
                    max: self.max_rect_body,
                });
            }
            Ok(None) => {
                src.reserve(RECT_HEADER_LEN + 4);
                return Ok(None);
            }
            Err(source) => return self.fail(RfbError::Decode { encoding, source }),
        };
        if body_len > self.max_rect_body {
            return self.fail(RfbError::MessageTooLarge {
                size: body_len,
                max: self.max_rect_body,
            });
        }
        let total = RECT_HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(RECT_HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        self.scan = BodyScan::default();
        self.state = ReceiverState::Dispatching {
            remaining: remaining - 1,
        };
        trace!(rect = %rect, encoding, bytes = body_len, "rectangle framed");
        Ok(Some(ServerEvent::Rectangle {
            header: RectHeader { rect, encoding },
            body,
        }))
    }

    fn finish_update(&mut self) -> Result<Option<ServerEvent>, RfbError> {
        self.state = ReceiverState::AwaitingMessageType;
        Ok(Some(ServerEvent::UpdateEnd))
    }
}

impl Decoder for ServerMessageDecoder {
    type Item = ServerEvent;
    type Error = RfbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReceiverState::Closed => {
                    src.clear();
                    return Ok(None);
                }
                ReceiverState::AwaitingMessageType => {
                    let Some(&byte) = src.first() else {
                        return Ok(None);
                    };
                    let message_type = match ServerMessageType::try_from(byte) {
                        Ok(t) => t,
                        Err(e) => return self.fail(e),
                    };
                    src.advance(1);
                    self.state = ReceiverState::AwaitingMessageBody(message_type);
                }
                ReceiverState::AwaitingMessageBody(ServerMessageType::FramebufferUpdate) => {
                    if src.len() < 3 {
                        return Ok(None);
                    }
                    src.advance(1);
                    let rectangles = src.get_u16();
                    self.state = ReceiverState::Dispatching {
                        remaining: rectangles,
                    };
                    trace!(rectangles, "framebuffer update");
                    return Ok(Some(ServerEvent::UpdateBegin { rectangles }));
                }
                ReceiverState::Dispatching { remaining: 0 } => return self.finish_update(),
                ReceiverState::Dispatching { remaining } => {
                    return self.decode_rectangle(src, remaining);
                }
                ReceiverState::AwaitingMessageBody(ServerMessageType::SetColourMapEntries) => {
                    if src.len() < 5 {
                        return Ok(None);
                    }
                    let count = u16::from_be_bytes([src[3], src[4]]) as usize;
                    let total = 5 + count * 6;
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }
                    src.advance(1);
                    let first = src.get_u16();
                    src.advance(2);
                    let colours = (0..count)
                        .map(|_| [src.get_u16(), src.get_u16(), src.get_u16()])
                        .collect();
                    self.state = ReceiverState::AwaitingMessageType;
                    return Ok(Some(ServerEvent::SetColourMapEntries { first, colours }));
                }
                ReceiverState::AwaitingMessageBody(ServerMessageType::Bell) => {
                    self.state = ReceiverState::AwaitingMessageType;
                    return Ok(Some(ServerEvent::Bell));
                }
                ReceiverState::AwaitingMessageBody(ServerMessageType::ServerCutText) => {
                    if src.len() < 7 {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
                    if len > self.max_cut_text {
                        return self.fail(RfbError::MessageTooLarge {
                            size: len,
                            max: self.max_cut_text,
                        });
                    }
                    if src.len() < 7 + len {
                        src.reserve(7 + len - src.len());
                        return Ok(None);
                    }
                    src.advance(7);
                    let text = latin1_decode(&src.split_to(len));
                    self.state = ReceiverState::AwaitingMessageType;
                    return Ok(Some(ServerEvent::ServerCutText(text)));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(event) => Ok(Some(event)),
            None => match self.state {
                ReceiverState::AwaitingMessageType if buf.is_empty() => Ok(None),
                ReceiverState::Closed => Ok(None),
                _ => {
                    let pending = buf.len();
                    self.fail(RfbError::UnexpectedEof(pending))
                }
            },
        }
    }
}
