//! # rfb-core
//!
//! Client-side engine for the RFB (VNC) remote framebuffer protocol.
//!
//! This crate contains:
//! - **Protocol**: version/security handshake, VNC authentication, the
//!   `ServerMessageDecoder` and `ClientMessageCodec` wire codecs
//! - **Encodings**: `EncodingRegistry` with Raw, CopyRect, RRE, Hextile and ZRLE codecs
//! - **Framebuffer**: `FramebufferSource`, the scoped writer `FramebufferReference`
//!   and the read-only `FramebufferSnapshot`
//! - **Network**: `MessageSender`, `MessageReceiver` and the `Connection` façade
//! - **Task**: `BackgroundTask`, a cancellable unit of work with failure listeners
//! - **State**: the `ConnectionPhase` lifecycle state machine
//! - **Error**: `RfbError`, typed and classified through `ErrorKind`

pub mod encoding;
pub mod error;
pub mod flags;
pub mod framebuffer;
pub mod network;
pub mod protocol;
pub mod state;
pub mod task;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use encoding::{BodyScan, Codec, DecodeContext, EncodingRegistry};
pub use error::{DecodeError, ErrorKind, LifecycleError, RfbError};
pub use flags::ButtonMask;
pub use framebuffer::{Framebuffer, FramebufferReference, FramebufferSnapshot, FramebufferSource};
pub use network::{
    Connection, ConnectionContext, ConnectionInfo, MessageReceiver, MessageSender, ReceiverStats,
    RfbProtocol, SessionConfig, SessionEvent,
};
pub use protocol::{ClientMessage, ProtocolVersion, SecurityType, ServerEvent, ServerInit};
pub use state::{ConnectionPhase, HandshakeStep};
pub use task::{BackgroundTask, ThreadState};
pub use types::{ColourMap, FrameSize, PixelFormat, Rect};
