//! Inbound half of a connection: the receive loop.
//!
//! [`MessageReceiver`] pulls [`ServerEvent`]s from a `FramedRead` driven by
//! the [`ServerMessageDecoder`] and applies them. For each rectangle it
//! acquires the framebuffer, runs the codec over exactly the rectangle's
//! bytes and releases the buffer again. `FrameReady` goes out once the
//! whole update has been applied.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::sender::MessageSender;
use crate::encoding::{DecodeContext, EncodingRegistry};
use crate::error::RfbError;
use crate::framebuffer::FramebufferSource;
use crate::protocol::server::RectHeader;
use crate::protocol::{ServerEvent, ServerMessageDecoder};
use crate::types::{FrameSize, PixelFormat};

pub(crate) type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

const FPS_WINDOW: usize = 60;

// ── SessionEvent ─────────────────────────────────────────────────

/// Notification from a running connection.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A framebuffer update has been fully applied.
    FrameReady {
        generation: u64,
        size: FrameSize,
        rectangles: u32,
    },
    /// The server changed the desktop size. A fresh buffer generation
    /// has been allocated.
    Resized(FrameSize),
    Bell,
    ServerCutText(String),
    ColourMapUpdated { first: u16, count: u16 },
    /// The session ended without error (server closed or stopped locally).
    Closed,
    /// The session ended with a fatal error.
    Failed(Arc<RfbError>),
}

// ── ReceiverStats ────────────────────────────────────────────────

/// Receive-side statistics exposed to the UI.
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    /// Framebuffer updates completed.
    pub updates: u64,
    /// Rectangles decoded.
    pub rectangles: u64,
    /// Encoded rectangle bytes decoded.
    pub bytes: u64,
    /// Smoothed updates per second.
    pub fps: f64,
    pub frame_size: FrameSize,
}

#[derive(Debug, Default)]
struct FpsMeter {
    samples: VecDeque<Duration>,
    last: Option<Instant>,
}

impl FpsMeter {
    fn tick(&mut self) -> f64 {
        let now = Instant::now();
        if let Some(last) = self.last.replace(now) {
            self.samples.push_back(now.duration_since(last));
            if self.samples.len() > FPS_WINDOW {
                self.samples.pop_front();
            }
        }
        if self.samples.is_empty() {
            return 0.0;
        }
        let avg = self.samples.iter().map(Duration::as_secs_f64).sum::<f64>()
            / self.samples.len() as f64;
        if avg > 0.0 { 1.0 / avg } else { 0.0 }
    }
}

// ── MessageReceiver ──────────────────────────────────────────────

/// Receive loop of one connection. Consumed by [`run`](Self::run).
pub struct MessageReceiver {
    reader: FramedRead<BoxedReader, ServerMessageDecoder>,
    registry: Arc<EncodingRegistry>,
    framebuffer: FramebufferSource,
    context: DecodeContext,
    sender: MessageSender,
    pixel_format: watch::Receiver<PixelFormat>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats_tx: watch::Sender<ReceiverStats>,
    stats: ReceiverStats,
    fps: FpsMeter,
    frame_size: FrameSize,
    update_rectangles: u32,
    auto_refresh: bool,
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("state", &self.reader.decoder().state())
            .field("frame_size", &self.frame_size)
            .field("auto_refresh", &self.auto_refresh)
            .finish()
    }
}

impl MessageReceiver {
    /// Build a receiver for `reader`.
    ///
    /// The decoder starts in the sender's current pixel format and follows
    /// later `SetPixelFormat` requests made through `sender`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R>(
        reader: R,
        registry: Arc<EncodingRegistry>,
        framebuffer: FramebufferSource,
        frame_size: FrameSize,
        sender: MessageSender,
        events: mpsc::UnboundedSender<SessionEvent>,
        limits: (usize, usize),
        auto_refresh: bool,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let mut pixel_format = sender.watch_pixel_format();
        let current = *pixel_format.borrow_and_update();
        let decoder = ServerMessageDecoder::new(Arc::clone(&registry), frame_size, current)
            .with_limits(limits.0, limits.1);
        let reader: BoxedReader = Box::pin(reader);
        let stats = ReceiverStats {
            frame_size,
            ..ReceiverStats::default()
        };
        let (stats_tx, _) = watch::channel(stats.clone());
        Self {
            reader: FramedRead::new(reader, decoder),
            registry,
            framebuffer,
            context: DecodeContext::new(current),
            sender,
            pixel_format,
            events,
            stats_tx,
            stats,
            fps: FpsMeter::default(),
            frame_size,
            update_rectangles: 0,
            auto_refresh,
        }
    }

    /// Subscribe to statistics. Updated after every completed update.
    pub fn stats(&self) -> watch::Receiver<ReceiverStats> {
        self.stats_tx.subscribe()
    }

    /// Run until the server closes the stream, `cancel` fires or a fatal
    /// error occurs.
    ///
    /// A clean end emits [`SessionEvent::Closed`]. Errors are returned to
    /// the caller, which reports them through its failure path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RfbError> {
        info!(size = %self.frame_size, "receive loop started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("receive loop cancelled");
                    break;
                }
                next = self.reader.next() => next,
            };
            let Some(event) = next.transpose()? else {
                info!("server closed the connection");
                break;
            };
            self.apply(event, &cancel).await?;
        }
        self.emit(SessionEvent::Closed);
        Ok(())
    }

    async fn apply(&mut self, event: ServerEvent, cancel: &CancellationToken) -> Result<(), RfbError> {
        match event {
            ServerEvent::UpdateBegin { rectangles } => {
                self.sender.update_started();
                self.follow_pixel_format();
                self.update_rectangles = 0;
                trace!(rectangles, "update begin");
            }
            ServerEvent::DesktopSize(size) => {
                self.frame_size = size;
                // Allocate now so a resize-only update still yields a buffer
                // of the new size.
                drop(self.framebuffer.acquire(size, cancel).await?);
                self.framebuffer.publish();
                info!(size = %size, "desktop resized");
                self.emit(SessionEvent::Resized(size));
            }
            ServerEvent::Rectangle { header, body } => {
                self.decode_rectangle(header, &body, cancel).await?;
            }
            ServerEvent::UpdateEnd => self.finish_update().await?,
            ServerEvent::SetColourMapEntries { first, colours } => {
                self.context.colours_mut().set_entries(first, &colours);
                debug!(first, count = colours.len(), "colour map updated");
                self.emit(SessionEvent::ColourMapUpdated {
                    first,
                    count: colours.len() as u16,
                });
            }
            ServerEvent::Bell => self.emit(SessionEvent::Bell),
            ServerEvent::ServerCutText(text) => {
                debug!(len = text.len(), "server cut text");
                self.emit(SessionEvent::ServerCutText(text));
            }
        }
        Ok(())
    }

    async fn decode_rectangle(
        &mut self,
        header: RectHeader,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), RfbError> {
        let RectHeader { rect, encoding } = header;
        let codec = self
            .registry
            .lookup(encoding)
            .ok_or(RfbError::UnknownEncoding(encoding))?;
        let mut framebuffer = self.framebuffer.acquire(self.frame_size, cancel).await?;
        codec
            .decode(body, rect, &mut self.context, &mut framebuffer)
            .map_err(|source| RfbError::Decode { encoding, source })?;
        drop(framebuffer);

        trace!(codec = codec.name(), rect = %rect, bytes = body.len(), "rectangle decoded");
        self.update_rectangles += 1;
        self.stats.rectangles += 1;
        self.stats.bytes += body.len() as u64;
        Ok(())
    }

    async fn finish_update(&mut self) -> Result<(), RfbError> {
        let generation = self
            .framebuffer
            .publish()
            .unwrap_or_else(|| self.framebuffer.latest_generation());
        self.stats.updates += 1;
        self.stats.fps = self.fps.tick();
        self.stats.frame_size = self.frame_size;
        self.stats_tx.send_replace(self.stats.clone());

        trace!(generation, rectangles = self.update_rectangles, "frame ready");
        self.emit(SessionEvent::FrameReady {
            generation,
            size: self.frame_size,
            rectangles: self.update_rectangles,
        });

        if self.sender.flush_pending_pixel_format().await? {
            debug!("held-back pixel format sent");
        }
        if self.auto_refresh && !self.frame_size.is_empty() {
            self.sender
                .send_framebuffer_update_request(self.frame_size.bounds(), true)
                .await?;
        }
        Ok(())
    }

    /// Apply a pixel format requested through the sender since the last
    /// update. Only called at an update boundary.
    fn follow_pixel_format(&mut self) {
        if !self.pixel_format.has_changed().unwrap_or(false) {
            return;
        }
        let pixel_format = *self.pixel_format.borrow_and_update();
        debug!(format = %pixel_format, "switching pixel format");
        self.reader.decoder_mut().set_pixel_format(pixel_format);
        self.context.set_pixel_format(pixel_format);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("session event dropped, no listener");
        }
    }
}
