//! Session setup: version, security and initialisation exchange.
//!
//! ```text
//! S: "RFB 003.008\n"        C: "RFB 003.008\n"
//! S: security types          C: chosen type
//! S: challenge (VNC auth)    C: response
//! S: SecurityResult
//!                            C: ClientInit (shared flag)
//! S: ServerInit (size, pixel format, name)
//! ```
//!
//! The whole exchange runs under one deadline.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::auth;
use crate::error::RfbError;
use crate::state::{ConnectionPhase, HandshakeStep};
use crate::types::{FrameSize, PixelFormat};

/// Length of the version banner.
pub const BANNER_LEN: usize = 12;

/// Longest failure reason or desktop name accepted during setup.
pub const MAX_SETUP_STRING: usize = 64 * 1024;

// ── ProtocolVersion ──────────────────────────────────────────────

/// Protocol versions this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    /// Pick the version to answer a server banner with.
    ///
    /// Minor versions above 8 are answered with 3.8, 4 to 6 with 3.3.
    pub fn negotiate(banner: &[u8; BANNER_LEN]) -> Result<Self, RfbError> {
        let unsupported = || RfbError::UnsupportedVersion(String::from_utf8_lossy(banner).into());
        if &banner[..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
            return Err(unsupported());
        }
        let number = |digits: &[u8]| -> Option<u32> {
            std::str::from_utf8(digits).ok()?.parse().ok()
        };
        let (Some(major), Some(minor)) = (number(&banner[4..7]), number(&banner[8..11])) else {
            return Err(unsupported());
        };
        match (major, minor) {
            (3, 3..=6) => Ok(ProtocolVersion::V3_3),
            (3, 7) => Ok(ProtocolVersion::V3_7),
            (3, m) if m >= 8 => Ok(ProtocolVersion::V3_8),
            _ => Err(unsupported()),
        }
    }

    /// The banner the client sends back.
    pub fn banner(&self) -> &'static [u8; BANNER_LEN] {
        match self {
            ProtocolVersion::V3_3 => b"RFB 003.003\n",
            ProtocolVersion::V3_7 => b"RFB 003.007\n",
            ProtocolVersion::V3_8 => b"RFB 003.008\n",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V3_3 => write!(f, "3.3"),
            ProtocolVersion::V3_7 => write!(f, "3.7"),
            ProtocolVersion::V3_8 => write!(f, "3.8"),
        }
    }
}

// ── SecurityType ─────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityType {
    None = 1,
    VncAuth = 2,
}

impl TryFrom<u8> for SecurityType {
    type Error = RfbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SecurityType::None),
            2 => Ok(SecurityType::VncAuth),
            _ => Err(RfbError::UnknownVariant {
                type_name: "SecurityType",
                value: value as u64,
            }),
        }
    }
}

/// Choose from the server's list: VNC auth when a password is at hand,
/// otherwise None.
pub fn select_security(offered: &[u8], has_password: bool) -> Result<SecurityType, RfbError> {
    let vnc = offered.contains(&(SecurityType::VncAuth as u8));
    let none = offered.contains(&(SecurityType::None as u8));
    match (vnc, none, has_password) {
        (true, _, true) => Ok(SecurityType::VncAuth),
        (_, true, _) => Ok(SecurityType::None),
        (true, false, false) => Err(RfbError::PasswordRequired),
        _ => Err(RfbError::NoSecurityType(
            offered.iter().copied().map(u32::from).collect(),
        )),
    }
}

// ── ServerInit ───────────────────────────────────────────────────

/// The server's description of the desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub size: FrameSize,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    /// Serialize as the server would send it.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.size.width);
        dst.put_u16(self.size.height);
        self.pixel_format.encode(dst);
        dst.put_u32(self.name.len() as u32);
        dst.put_slice(self.name.as_bytes());
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// Client side choices for the handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    pub password: Option<String>,
    /// Ask the server to leave other clients connected.
    pub shared: bool,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: ProtocolVersion,
    pub security: SecurityType,
    pub server_init: ServerInit,
}

/// Run the handshake on `stream`, failing with [`RfbError::Timeout`] when
/// it does not complete within `timeout`.
///
/// `phase` must be `Connecting`. It steps through the handshake and is left
/// at the last step entered, on failure too.
pub async fn handshake<S>(
    stream: &mut S,
    options: &HandshakeOptions,
    timeout: Duration,
    phase: &mut ConnectionPhase,
) -> Result<Negotiated, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, run(stream, options, phase))
        .await
        .map_err(|_| RfbError::Timeout(timeout))?
}

async fn run<S>(
    stream: &mut S,
    options: &HandshakeOptions,
    phase: &mut ConnectionPhase,
) -> Result<Negotiated, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    phase.enter(HandshakeStep::Version)?;
    let mut banner = [0u8; BANNER_LEN];
    stream.read_exact(&mut banner).await?;
    let version = ProtocolVersion::negotiate(&banner)?;
    stream.write_all(version.banner()).await?;
    info!(
        server = %String::from_utf8_lossy(&banner[..11]),
        version = %version,
        "protocol version negotiated"
    );

    phase.enter(HandshakeStep::Security)?;
    let security = match version {
        ProtocolVersion::V3_3 => {
            let chosen = stream.read_u32().await?;
            match chosen {
                0 => return Err(RfbError::ConnectionRefused(read_reason(stream).await?)),
                1 => SecurityType::None,
                2 if options.password.is_some() => SecurityType::VncAuth,
                2 => return Err(RfbError::PasswordRequired),
                other => return Err(RfbError::NoSecurityType(vec![other])),
            }
        }
        ProtocolVersion::V3_7 | ProtocolVersion::V3_8 => {
            let count = stream.read_u8().await?;
            if count == 0 {
                return Err(RfbError::ConnectionRefused(read_reason(stream).await?));
            }
            let mut offered = vec![0u8; count as usize];
            stream.read_exact(&mut offered).await?;
            debug!(?offered, "security types offered");
            let chosen = select_security(&offered, options.password.is_some())?;
            stream.write_all(&[chosen as u8]).await?;
            chosen
        }
    };

    if security == SecurityType::VncAuth {
        phase.enter(HandshakeStep::Authentication)?;
        let mut challenge = [0u8; auth::CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await?;
        let password = options.password.as_deref().unwrap_or_default();
        let response = auth::challenge_response(&challenge, password.as_bytes());
        stream.write_all(&response).await?;
    }

    if version == ProtocolVersion::V3_8 || security == SecurityType::VncAuth {
        let result = stream.read_u32().await?;
        if result != 0 {
            let reason = if version == ProtocolVersion::V3_8 {
                read_reason(stream).await?
            } else {
                "authentication failed".to_string()
            };
            return Err(RfbError::AuthFailed(reason));
        }
    }
    info!(security = ?security, "security handshake complete");

    phase.enter(HandshakeStep::Init)?;

    stream.write_all(&[options.shared as u8]).await?;

    let mut fixed = [0u8; 4 + PixelFormat::SIZE + 4];
    stream.read_exact(&mut fixed).await?;
    let mut head = &fixed[..];
    let size = FrameSize::new(head.get_u16(), head.get_u16());
    let pixel_format = PixelFormat::decode(&mut head);
    if let Err(reason) = pixel_format.validate() {
        warn!(pixel_format = ?pixel_format, reason, "unusable server pixel format");
        return Err(RfbError::ProtocolViolation(reason));
    }
    let name_len = head.get_u32() as usize;
    let name = read_string(stream, name_len).await?;

    let server_init = ServerInit {
        size,
        pixel_format,
        name,
    };
    info!(
        name = %server_init.name,
        size = %server_init.size,
        pixel_format = %server_init.pixel_format,
        "server init"
    );
    Ok(Negotiated {
        version,
        security,
        server_init,
    })
}

async fn read_reason<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, RfbError> {
    let len = stream.read_u32().await? as usize;
    read_string(stream, len).await
}

async fn read_string<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Result<String, RfbError> {
    if len > MAX_SETUP_STRING {
        return Err(RfbError::MessageTooLarge {
            size: len,
            max: MAX_SETUP_STRING,
        });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
