//! Protocol façade and the managed client connection.
//!
//! [`RfbProtocol`] owns the encoding registry and builds the two halves of
//! a session. [`RfbProtocol::connect`] and [`RfbProtocol::open`] run the
//! whole setup and hand back a [`Connection`] whose receive loop is
//! already running:
//!
//! ```text
//! handshake ─▶ SetPixelFormat ─▶ SetEncodings ─▶ FramebufferUpdateRequest ─▶ receive loop
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::receiver::{MessageReceiver, ReceiverStats, SessionEvent};
use super::sender::MessageSender;
use crate::encoding::EncodingRegistry;
use crate::error::RfbError;
use crate::framebuffer::{FramebufferSnapshot, FramebufferSource};
use crate::protocol::encodings;
use crate::protocol::handshake::{self, HandshakeOptions, Negotiated};
use crate::protocol::server::{MAX_CUT_TEXT, MAX_RECT_BODY};
use crate::protocol::{ProtocolVersion, ServerInit};
use crate::state::ConnectionPhase;
use crate::task::{BackgroundTask, ThreadState};
use crate::types::{FrameSize, PixelFormat};

/// Default RFB port (display :0).
pub const DEFAULT_PORT: u16 = 5900;

// ── ConnectionInfo ───────────────────────────────────────────────

/// Address of an RFB server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ConnectionInfo {
    type Err = RfbError;

    /// Parses `host`, `host:port` or `[v6addr]:port`. The port defaults
    /// to 5900.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RfbError::InvalidArgument(format!("invalid server address {s:?}"));
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(Self::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, DEFAULT_PORT)),
            Some((host, port)) if !host.is_empty() => {
                Ok(Self::new(host, port.parse().map_err(|_| invalid())?))
            }
            None if !s.is_empty() => Ok(Self::new(s, DEFAULT_PORT)),
            _ => Err(invalid()),
        }
    }
}

// ── SessionConfig ────────────────────────────────────────────────

/// Client-side settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub password: Option<String>,
    /// Ask the server to keep other clients connected.
    pub shared: bool,
    /// Pixel format requested right after the handshake.
    pub pixel_format: PixelFormat,
    /// Encoding preference list. `None` advertises everything supported.
    pub encodings: Option<Vec<i32>>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Request the next incremental update after each completed one.
    pub auto_refresh: bool,
    pub max_rect_body: usize,
    pub max_cut_text: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            password: None,
            shared: true,
            pixel_format: PixelFormat::bgra32(),
            encodings: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            auto_refresh: true,
            max_rect_body: MAX_RECT_BODY,
            max_cut_text: MAX_CUT_TEXT,
        }
    }
}

// ── ConnectionContext ────────────────────────────────────────────

/// What the sender and receiver of one session are built from.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub version: ProtocolVersion,
    pub server_init: ServerInit,
    /// Format the server sends until a SetPixelFormat takes effect.
    pub pixel_format: PixelFormat,
    pub framebuffer: FramebufferSource,
    pub auto_refresh: bool,
    pub max_rect_body: usize,
    pub max_cut_text: usize,
}

impl ConnectionContext {
    pub fn new(negotiated: &Negotiated, config: &SessionConfig) -> Self {
        Self {
            version: negotiated.version,
            server_init: negotiated.server_init.clone(),
            pixel_format: negotiated.server_init.pixel_format,
            framebuffer: FramebufferSource::new(),
            auto_refresh: config.auto_refresh,
            max_rect_body: config.max_rect_body,
            max_cut_text: config.max_cut_text,
        }
    }

    pub fn frame_size(&self) -> FrameSize {
        self.server_init.size
    }
}

// ── RfbProtocol ──────────────────────────────────────────────────

/// Entry point: shared codec registry plus session factories.
#[derive(Debug, Clone)]
pub struct RfbProtocol {
    registry: Arc<EncodingRegistry>,
}

impl Default for RfbProtocol {
    fn default() -> Self {
        Self::new(EncodingRegistry::with_defaults())
    }
}

impl RfbProtocol {
    pub fn new(registry: EncodingRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<EncodingRegistry> {
        &self.registry
    }

    /// Encodings to advertise: codecs in priority order, then the
    /// pseudo-encodings the receiver handles itself.
    pub fn supported_encodings(&self) -> Vec<i32> {
        let mut ids = self.registry.encodings().to_vec();
        ids.extend([encodings::DESKTOP_SIZE, encodings::LAST_RECT]);
        ids
    }

    pub fn create_sender<W>(&self, ctx: &ConnectionContext, writer: W) -> MessageSender
    where
        W: AsyncWrite + Send + 'static,
    {
        MessageSender::new(writer, ctx.pixel_format)
    }

    pub fn create_receiver<R>(
        &self,
        ctx: &ConnectionContext,
        reader: R,
        sender: MessageSender,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> MessageReceiver
    where
        R: AsyncRead + Send + 'static,
    {
        MessageReceiver::new(
            reader,
            Arc::clone(&self.registry),
            ctx.framebuffer.clone(),
            ctx.frame_size(),
            sender,
            events,
            (ctx.max_rect_body, ctx.max_cut_text),
            ctx.auto_refresh,
        )
    }

    /// Connect over TCP (with `TCP_NODELAY`) and start a session.
    pub async fn connect(
        &self,
        info: &ConnectionInfo,
        config: SessionConfig,
    ) -> Result<Connection, RfbError> {
        let mut phase = ConnectionPhase::default();
        phase.begin_connect()?;
        info!("connecting to {info}");

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((info.host(), info.port())),
        )
        .await
        .map_err(|_| RfbError::Timeout(config.connect_timeout))
        .and_then(|r| r.map_err(RfbError::from));
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("connect to {info} failed: {e}");
                return Err(e);
            }
        };
        stream.set_nodelay(true)?;
        self.establish(stream, config, phase).await
    }

    /// Start a session over an already open transport.
    pub async fn open<S>(&self, stream: S, config: SessionConfig) -> Result<Connection, RfbError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut phase = ConnectionPhase::default();
        phase.begin_connect()?;
        self.establish(stream, config, phase).await
    }

    async fn establish<S>(
        &self,
        mut stream: S,
        config: SessionConfig,
        mut phase: ConnectionPhase,
    ) -> Result<Connection, RfbError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = HandshakeOptions {
            password: config.password.clone(),
            shared: config.shared,
        };
        let negotiated = handshake::handshake(
            &mut stream,
            &options,
            config.handshake_timeout,
            &mut phase,
        )
        .await;
        let negotiated = match negotiated {
            Ok(n) => n,
            Err(e) => {
                warn!(%phase, "handshake failed: {e}");
                return Err(e);
            }
        };
        let ctx = ConnectionContext::new(&negotiated, &config);
        info!(
            name = %ctx.server_init.name,
            size = %ctx.frame_size(),
            version = %ctx.version,
            "session established"
        );

        let (reader, writer) = tokio::io::split(stream);
        let sender = self.create_sender(&ctx, writer);
        let encodings = config
            .encodings
            .clone()
            .unwrap_or_else(|| self.supported_encodings());
        sender.send_set_pixel_format(config.pixel_format).await?;
        sender.send_client_encodings(&encodings).await?;
        if !ctx.frame_size().is_empty() {
            sender
                .send_framebuffer_update_request(ctx.frame_size().bounds(), false)
                .await?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let receiver = self.create_receiver(&ctx, reader, sender.clone(), events_tx.clone());
        let stats = receiver.stats();

        phase.establish()?;
        let phase = Arc::new(Mutex::new(phase));
        let job_phase = Arc::clone(&phase);
        let task = BackgroundTask::new(
            format!("rfb-receiver {}", ctx.server_init.name),
            move |token| async move {
                let result = receiver.run(token).await;
                if result.is_ok() && lock(&job_phase).remote_closed() {
                    info!("server closed the session");
                }
                result
            },
        )?;
        let failed_phase = Arc::clone(&phase);
        task.on_failure(move |err| {
            warn!("session failed: {err}");
            lock(&failed_phase).fail(Arc::clone(&err));
            let _ = events_tx.send(SessionEvent::Failed(err));
        });
        task.start()?;

        Ok(Connection {
            ctx,
            sender,
            task,
            events: events_rx,
            stats,
            phase,
        })
    }
}

// ── Connection ───────────────────────────────────────────────────

/// A running client session.
///
/// Dropping the connection cancels the receive loop without waiting;
/// call [`close`](Self::close) for an orderly shutdown.
#[derive(Debug)]
pub struct Connection {
    ctx: ConnectionContext,
    sender: MessageSender,
    task: BackgroundTask,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    stats: watch::Receiver<ReceiverStats>,
    phase: Arc<Mutex<ConnectionPhase>>,
}

impl Connection {
    pub fn server_name(&self) -> &str {
        &self.ctx.server_init.name
    }

    pub fn version(&self) -> ProtocolVersion {
        self.ctx.version
    }

    /// ServerInit as received during the handshake.
    pub fn server_init(&self) -> &ServerInit {
        &self.ctx.server_init
    }

    /// Frame size as of the last completed update or resize.
    pub fn frame_size(&self) -> FrameSize {
        self.stats.borrow().frame_size
    }

    /// Read-only snapshot of the last completed frame for one paint.
    ///
    /// Blocks only until the first frame is published. A stale
    /// `frame_size` never resizes the buffer.
    pub fn grab_framebuffer_reference(
        &self,
        frame_size: FrameSize,
    ) -> Result<FramebufferSnapshot, RfbError> {
        self.ctx.framebuffer.grab_framebuffer_reference(frame_size)
    }

    pub fn framebuffer(&self) -> &FramebufferSource {
        &self.ctx.framebuffer
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Next session event; `None` once the receive loop is gone and all
    /// events were taken.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Register a callback for a fatal session error. Called at most once.
    pub fn on_failure<F>(&self, listener: F)
    where
        F: FnOnce(Arc<RfbError>) + Send + 'static,
    {
        self.task.on_failure(listener);
    }

    pub fn stats(&self) -> watch::Receiver<ReceiverStats> {
        self.stats.clone()
    }

    /// `Failed` carries the error that ended the receive loop.
    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.phase).clone()
    }

    pub fn receiver_state(&self) -> ThreadState {
        self.task.state()
    }

    /// Stop the receive loop, shut down the write half and release the
    /// framebuffer source. Safe to call more than once.
    pub async fn close(&self) {
        let begun = lock(&self.phase).begin_close();
        self.task.stop_and_wait().await;
        self.task.dispose();
        if let Err(e) = self.sender.close().await {
            debug!("write half shutdown: {e}");
        }
        self.ctx.framebuffer.close();
        if begun {
            let _ = lock(&self.phase).finish_close();
            info!(name = %self.ctx.server_init.name, "connection closed");
        }
    }
}

fn lock(phase: &Mutex<ConnectionPhase>) -> MutexGuard<'_, ConnectionPhase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addresses() {
        let info: ConnectionInfo = "example.org:5901".parse().unwrap();
        assert_eq!(info, ConnectionInfo::new("example.org", 5901));
        assert_eq!(info.to_string(), "example.org:5901");

        let info: ConnectionInfo = "10.0.0.2".parse().unwrap();
        assert_eq!(info.port(), DEFAULT_PORT);

        let info: ConnectionInfo = "[::1]:5902".parse().unwrap();
        assert_eq!(info.host(), "::1");
        assert_eq!(info.port(), 5902);
        assert_eq!(info.to_string(), "[::1]:5902");

        let info: ConnectionInfo = "::1".parse().unwrap();
        assert_eq!(info.host(), "::1");
        assert_eq!(info.port(), DEFAULT_PORT);
    }

    #[test]
    fn reject_bad_addresses() {
        for bad in ["", ":5900", "host:port", "host:70000", "[::1", "[::1]x"] {
            assert!(bad.parse::<ConnectionInfo>().is_err(), "{bad}");
        }
    }

    #[test]
    fn supported_encodings_end_with_pseudo() {
        let protocol = RfbProtocol::default();
        let ids = protocol.supported_encodings();
        assert_eq!(
            ids,
            vec![
                encodings::ZRLE,
                encodings::HEXTILE,
                encodings::RRE,
                encodings::COPY_RECT,
                encodings::RAW,
                encodings::DESKTOP_SIZE,
                encodings::LAST_RECT,
            ]
        );
    }

    #[test]
    fn default_session_config() {
        let config = SessionConfig::default();
        assert!(config.auto_refresh);
        assert!(config.shared);
        assert_eq!(config.pixel_format, PixelFormat::bgra32());
        assert_eq!(config.max_rect_body, MAX_RECT_BODY);
    }
}
