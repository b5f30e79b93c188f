//! Session lifecycle as seen from the client.
//!
//! The handshake is tracked step by step so a failed setup reports how far
//! it got. A session that ends on a receive error keeps that error as its
//! terminal phase; one the server ends cleanly is just `Closed`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LifecycleError, RfbError};

// ── HandshakeStep ────────────────────────────────────────────────

/// Setup exchanges in wire order. Authentication is skipped when the
/// negotiated security type is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeStep {
    Version,
    Security,
    Authentication,
    Init,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Version => "version",
            Self::Security => "security",
            Self::Authentication => "authentication",
            Self::Init => "init",
        })
    }
}

// ── ConnectionPhase ──────────────────────────────────────────────

/// Where a session is in its life.
///
/// ```text
///  Idle ─► Connecting ─► Handshaking(step..) ─► Running ─► Closed
///               │               │                  │  ▲
///               └───────────────┴──► Closing ──────┼──┘
///                                                  ▼
///                                          Failed(error)
/// ```
#[derive(Debug, Clone, Default)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Handshaking(HandshakeStep),
    /// ServerInit received and the receive loop started.
    Running { since: Instant },
    /// The client asked for shutdown.
    Closing,
    Closed,
    /// The receive loop ended on this error.
    Failed(Arc<RfbError>),
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Handshaking(step) => write!(f, "handshaking ({step})"),
            Self::Running { .. } => f.write_str("running"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// `Closed` or `Failed`; nothing moves the phase after this.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&Arc<RfbError>> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// The last handshake step entered, while still handshaking.
    pub fn handshake_step(&self) -> Option<HandshakeStep> {
        match self {
            Self::Handshaking(step) => Some(*step),
            _ => None,
        }
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self {
            Self::Running { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    pub fn begin_connect(&mut self) -> Result<(), LifecycleError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(LifecycleError::InvalidTransition(
                "a session can only be connected once",
            )),
        }
    }

    /// Enter `step`. The first step must be `Version`; later steps only
    /// move forward.
    pub fn enter(&mut self, step: HandshakeStep) -> Result<(), LifecycleError> {
        let allowed = match self {
            Self::Connecting => step == HandshakeStep::Version,
            Self::Handshaking(current) => step > *current,
            _ => false,
        };
        if !allowed {
            return Err(LifecycleError::InvalidTransition(
                "handshake step out of order",
            ));
        }
        *self = Self::Handshaking(step);
        Ok(())
    }

    /// ServerInit is in and the session is live.
    pub fn establish(&mut self) -> Result<(), LifecycleError> {
        match self {
            Self::Handshaking(HandshakeStep::Init) => {
                *self = Self::Running {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LifecycleError::InvalidTransition(
                "session established before ServerInit",
            )),
        }
    }

    /// Record a fatal error. Ignored once closing or terminal, so an error
    /// raised by the client's own shutdown never masks it.
    pub fn fail(&mut self, err: Arc<RfbError>) -> bool {
        if self.is_terminal() || matches!(self, Self::Closing) {
            return false;
        }
        *self = Self::Failed(err);
        true
    }

    /// The server ended a running session without an error.
    pub fn remote_closed(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        *self = Self::Closed;
        true
    }

    /// Returns `false` when there is nothing left to close.
    pub fn begin_close(&mut self) -> bool {
        match self {
            Self::Connecting | Self::Handshaking(_) | Self::Running { .. } => {
                *self = Self::Closing;
                true
            }
            _ => false,
        }
    }

    pub fn finish_close(&mut self) -> Result<(), LifecycleError> {
        match self {
            Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(LifecycleError::InvalidTransition("no close in progress")),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
