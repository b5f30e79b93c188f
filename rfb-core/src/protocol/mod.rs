//! RFB wire protocol.
//!
//! - [`handshake`]: version, security and init exchange
//! - [`auth`]: VNC authentication challenge response
//! - [`client`]: client-to-server messages and their encoder
//! - [`server`]: server-to-client message decoder
//!
//! Message type discriminants use `TryFrom` so that unknown values
//! surface as [`RfbError::UnknownVariant`] instead of panicking.

pub mod auth;
pub mod client;
pub mod handshake;
pub mod server;

use std::fmt;

use crate::error::RfbError;

pub use client::{ClientMessage, ClientMessageCodec};
pub use handshake::{ProtocolVersion, SecurityType, ServerInit};
pub use server::{RectHeader, ServerEvent, ServerMessageDecoder};

// ── Encoding ids ─────────────────────────────────────────────────

/// Well-known encoding ids.
pub mod encodings {
    pub const RAW: i32 = 0;
    pub const COPY_RECT: i32 = 1;
    pub const RRE: i32 = 2;
    pub const HEXTILE: i32 = 5;
    pub const ZRLE: i32 = 16;

    /// Pseudo-encoding: the rectangle announces a new framebuffer size.
    pub const DESKTOP_SIZE: i32 = -223;
    /// Pseudo-encoding: no more rectangles follow in this update.
    pub const LAST_RECT: i32 = -224;

    /// Whether `id` is a pseudo-encoding handled by the engine itself.
    pub const fn is_pseudo(id: i32) -> bool {
        matches!(id, DESKTOP_SIZE | LAST_RECT)
    }
}

// ── ServerMessageType ────────────────────────────────────────────

/// First byte of every server-to-client message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessageType {
    FramebufferUpdate = 0,
    SetColourMapEntries = 1,
    Bell = 2,
    ServerCutText = 3,
}

impl TryFrom<u8> for ServerMessageType {
    type Error = RfbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ServerMessageType::FramebufferUpdate),
            1 => Ok(ServerMessageType::SetColourMapEntries),
            2 => Ok(ServerMessageType::Bell),
            3 => Ok(ServerMessageType::ServerCutText),
            _ => Err(RfbError::UnknownVariant {
                type_name: "ServerMessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for ServerMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessageType::FramebufferUpdate => write!(f, "FramebufferUpdate"),
            ServerMessageType::SetColourMapEntries => write!(f, "SetColourMapEntries"),
            ServerMessageType::Bell => write!(f, "Bell"),
            ServerMessageType::ServerCutText => write!(f, "ServerCutText"),
        }
    }
}

// ── ClientMessageType ────────────────────────────────────────────

/// First byte of every client-to-server message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMessageType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
    ClientCutText = 6,
}

impl TryFrom<u8> for ClientMessageType {
    type Error = RfbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClientMessageType::SetPixelFormat),
            2 => Ok(ClientMessageType::SetEncodings),
            3 => Ok(ClientMessageType::FramebufferUpdateRequest),
            4 => Ok(ClientMessageType::KeyEvent),
            5 => Ok(ClientMessageType::PointerEvent),
            6 => Ok(ClientMessageType::ClientCutText),
            _ => Err(RfbError::UnknownVariant {
                type_name: "ClientMessageType",
                value: value as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_type_roundtrip() {
        for v in 0u8..4 {
            let t = ServerMessageType::try_from(v).unwrap();
            assert_eq!(t as u8, v);
        }
        assert!(matches!(
            ServerMessageType::try_from(4),
            Err(RfbError::UnknownVariant { value: 4, .. })
        ));
    }

    #[test]
    fn client_message_type_gap() {
        assert!(ClientMessageType::try_from(1).is_err());
        assert_eq!(
            ClientMessageType::try_from(5).unwrap(),
            ClientMessageType::PointerEvent
        );
    }

    #[test]
    fn pseudo_encodings() {
        assert!(encodings::is_pseudo(encodings::DESKTOP_SIZE));
        assert!(encodings::is_pseudo(encodings::LAST_RECT));
        assert!(!encodings::is_pseudo(encodings::RAW));
    }
}
