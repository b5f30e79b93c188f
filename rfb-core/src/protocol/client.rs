//! Client-to-server messages.
//!
//! [`ClientMessage`] holds already-validated values; range checks on caller
//! input happen in [`crate::network::MessageSender`]. [`ClientMessageCodec`]
//! writes each message as one contiguous frame so a send is never
//! interleaved with another on the wire.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use super::ClientMessageType;
use crate::error::RfbError;
use crate::flags::ButtonMask;
use crate::types::{PixelFormat, Rect};

/// Largest encoding list a `SetEncodings` message can carry.
pub const MAX_ENCODINGS: usize = u16::MAX as usize;

/// One client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, rect: Rect },
    KeyEvent { down: bool, keysym: u32 },
    PointerEvent { buttons: ButtonMask, x: u16, y: u16 },
    /// Latin-1 encoded text.
    ClientCutText(Vec<u8>),
}

impl ClientMessage {
    pub fn message_type(&self) -> ClientMessageType {
        match self {
            ClientMessage::SetPixelFormat(_) => ClientMessageType::SetPixelFormat,
            ClientMessage::SetEncodings(_) => ClientMessageType::SetEncodings,
            ClientMessage::FramebufferUpdateRequest { .. } => {
                ClientMessageType::FramebufferUpdateRequest
            }
            ClientMessage::KeyEvent { .. } => ClientMessageType::KeyEvent,
            ClientMessage::PointerEvent { .. } => ClientMessageType::PointerEvent,
            ClientMessage::ClientCutText(_) => ClientMessageType::ClientCutText,
        }
    }

    /// Exact number of bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            ClientMessage::SetPixelFormat(_) => 4 + PixelFormat::SIZE,
            ClientMessage::SetEncodings(ids) => 4 + 4 * ids.len(),
            ClientMessage::FramebufferUpdateRequest { .. } => 10,
            ClientMessage::KeyEvent { .. } => 8,
            ClientMessage::PointerEvent { .. } => 6,
            ClientMessage::ClientCutText(text) => 8 + text.len(),
        }
    }
}

/// Encode `text` as Latin-1, replacing characters above U+00FF with `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Decode Latin-1 bytes; every byte maps to the code point of the same value.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// ── Codec ────────────────────────────────────────────────────────

/// `tokio_util` encoder for [`ClientMessage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientMessageCodec;

impl Encoder<ClientMessage> for ClientMessageCodec {
    type Error = RfbError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &item {
            ClientMessage::SetEncodings(ids) if ids.len() > MAX_ENCODINGS => {
                return Err(RfbError::InvalidArgument(format!(
                    "{} encodings exceed {MAX_ENCODINGS}",
                    ids.len()
                )));
            }
            ClientMessage::ClientCutText(text) if text.len() > u32::MAX as usize => {
                return Err(RfbError::InvalidArgument("cut text too long".into()));
            }
            _ => {}
        }

        dst.reserve(item.wire_len());
        dst.put_u8(item.message_type() as u8);
        match item {
            ClientMessage::SetPixelFormat(pf) => {
                dst.put_bytes(0, 3);
                pf.encode(dst);
            }
            ClientMessage::SetEncodings(ids) => {
                dst.put_u8(0);
                dst.put_u16(ids.len() as u16);
                for id in ids {
                    dst.put_i32(id);
                }
            }
            ClientMessage::FramebufferUpdateRequest { incremental, rect } => {
                dst.put_u8(incremental as u8);
                dst.put_u16(rect.x);
                dst.put_u16(rect.y);
                dst.put_u16(rect.width);
                dst.put_u16(rect.height);
            }
            ClientMessage::KeyEvent { down, keysym } => {
                dst.put_u8(down as u8);
                dst.put_u16(0);
                dst.put_u32(keysym);
            }
            ClientMessage::PointerEvent { buttons, x, y } => {
                dst.put_u8(buttons.bits());
                dst.put_u16(x);
                dst.put_u16(y);
            }
            ClientMessage::ClientCutText(text) => {
                dst.put_bytes(0, 3);
                dst.put_u32(text.len() as u32);
                dst.put_slice(&text);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: ClientMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let len = msg.wire_len();
        ClientMessageCodec.encode(msg, &mut buf).unwrap();
        assert_eq!(buf.len(), len);
        buf.to_vec()
    }

    #[test]
    fn pointer_event_layout() {
        let bytes = encode(ClientMessage::PointerEvent {
            buttons: ButtonMask::LEFT | ButtonMask::WHEEL_UP,
            x: 0x0102,
            y: 0xFFFF,
        });
        assert_eq!(bytes, vec![5, 0x09, 0x01, 0x02, 0xFF, 0xFF]);
    }

    #[test]
    fn key_event_layout() {
        let bytes = encode(ClientMessage::KeyEvent {
            down: true,
            keysym: 0xFF0D,
        });
        assert_eq!(bytes, vec![4, 1, 0, 0, 0, 0, 0xFF, 0x0D]);
    }

    #[test]
    fn set_encodings_layout() {
        let bytes = encode(ClientMessage::SetEncodings(vec![16, 0, -223]));
        assert_eq!(
            bytes,
            vec![
                2, 0, 0, 3, //
                0, 0, 0, 16, //
                0, 0, 0, 0, //
                0xFF, 0xFF, 0xFF, 0x21,
            ]
        );
    }

    #[test]
    fn update_request_layout() {
        let bytes = encode(ClientMessage::FramebufferUpdateRequest {
            incremental: true,
            rect: Rect::new(1, 2, 640, 480),
        });
        assert_eq!(bytes, vec![3, 1, 0, 1, 0, 2, 0x02, 0x80, 0x01, 0xE0]);
    }

    #[test]
    fn set_pixel_format_layout() {
        let bytes = encode(ClientMessage::SetPixelFormat(PixelFormat::bgra32()));
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(bytes[4], 32);
    }

    #[test]
    fn cut_text_latin1() {
        let text = latin1_encode("café €");
        assert_eq!(text, vec![b'c', b'a', b'f', 0xE9, b' ', b'?']);
        let bytes = encode(ClientMessage::ClientCutText(text));
        assert_eq!(&bytes[..8], &[6, 0, 0, 0, 0, 0, 0, 6]);
        assert_eq!(latin1_decode(&bytes[8..]), "café ?");
    }

    #[test]
    fn too_many_encodings_rejected() {
        let mut buf = BytesMut::new();
        let ids = vec![0i32; MAX_ENCODINGS + 1];
        let err = ClientMessageCodec
            .encode(ClientMessage::SetEncodings(ids), &mut buf)
            .unwrap_err();
        assert!(matches!(err, RfbError::InvalidArgument(_)));
        assert!(buf.is_empty());
    }
}
