//! Outbound half of a connection.
//!
//! [`MessageSender`] validates caller input, turns it into a
//! [`ClientMessage`] and writes it through a `FramedWrite`. The sink sits
//! behind an async mutex so every message reaches the wire whole, whichever
//! task sends it.
//!
//! A SetPixelFormat issued while a requested update has not started arriving
//! is held back. That update may already be on the wire in the old format,
//! so the change goes out once the receive loop has finished it.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

use crate::error::{ErrorKind, RfbError};
use crate::flags::ButtonMask;
use crate::protocol::client::{MAX_ENCODINGS, latin1_encode};
use crate::protocol::{ClientMessage, ClientMessageCodec};
use crate::types::{PixelFormat, Rect};

pub(crate) type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

type Sink = FramedWrite<BoxedWriter, ClientMessageCodec>;

#[derive(Debug, Default)]
struct UpdateTracking {
    /// An update request went out and no update has started since.
    awaiting_update: bool,
    pending_format: Option<PixelFormat>,
}

struct Inner {
    sink: Mutex<Sink>,
    closed: AtomicBool,
    pixel_format: watch::Sender<PixelFormat>,
    tracking: std::sync::Mutex<UpdateTracking>,
}

/// Cloneable handle for sending client messages.
#[derive(Clone)]
pub struct MessageSender {
    inner: Arc<Inner>,
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("closed", &self.is_closed())
            .field("pixel_format", &*self.inner.pixel_format.borrow())
            .finish()
    }
}

impl MessageSender {
    /// Wrap `writer`. `pixel_format` is the format the server currently
    /// sends, usually the one from ServerInit.
    pub fn new<W>(writer: W, pixel_format: PixelFormat) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let writer: BoxedWriter = Box::pin(writer);
        let (pixel_format, _) = watch::channel(pixel_format);
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(FramedWrite::new(writer, ClientMessageCodec)),
                closed: AtomicBool::new(false),
                pixel_format,
                tracking: std::sync::Mutex::default(),
            }),
        }
    }

    /// Write one message and flush it.
    ///
    /// A transport failure closes the sender; later sends fail with
    /// [`RfbError::ConnectionClosed`].
    pub async fn send(&self, message: ClientMessage) -> Result<(), RfbError> {
        if let ClientMessage::SetPixelFormat(pixel_format) = message {
            return self.send_set_pixel_format(pixel_format).await;
        }
        let mut sink = self.lock_sink().await?;
        self.write(&mut sink, message).await
    }

    async fn lock_sink(&self) -> Result<MutexGuard<'_, Sink>, RfbError> {
        if self.is_closed() {
            return Err(RfbError::ConnectionClosed);
        }
        let sink = self.inner.sink.lock().await;
        if self.is_closed() {
            return Err(RfbError::ConnectionClosed);
        }
        Ok(sink)
    }

    async fn write(&self, sink: &mut Sink, message: ClientMessage) -> Result<(), RfbError> {
        let message_type = message.message_type();
        if matches!(message, ClientMessage::FramebufferUpdateRequest { .. }) {
            self.tracking().awaiting_update = true;
        }
        match sink.send(message).await {
            Ok(()) => {
                trace!(message = ?message_type, "sent");
                Ok(())
            }
            Err(e) => {
                if e.kind() == ErrorKind::Transport {
                    self.inner.closed.store(true, Ordering::SeqCst);
                }
                debug!(message = ?message_type, error = %e, "send failed");
                Err(e)
            }
        }
    }

    /// PointerEvent. Coordinates must fit in `0..=65535`.
    pub async fn send_pointer_event(
        &self,
        x: i32,
        y: i32,
        buttons: ButtonMask,
    ) -> Result<(), RfbError> {
        let x = coordinate("pointer x", x)?;
        let y = coordinate("pointer y", y)?;
        self.send(ClientMessage::PointerEvent { buttons, x, y }).await
    }

    /// KeyEvent for an X11 keysym.
    pub async fn send_key_event(&self, keysym: u32, down: bool) -> Result<(), RfbError> {
        self.send(ClientMessage::KeyEvent { down, keysym }).await
    }

    /// SetEncodings, most preferred first.
    pub async fn send_client_encodings(&self, encodings: &[i32]) -> Result<(), RfbError> {
        if encodings.len() > MAX_ENCODINGS {
            return Err(RfbError::InvalidArgument(format!(
                "{} encodings exceed {MAX_ENCODINGS}",
                encodings.len()
            )));
        }
        self.send(ClientMessage::SetEncodings(encodings.to_vec()))
            .await
    }

    /// FramebufferUpdateRequest for `rect`.
    ///
    /// The rectangle must be non-empty and end within the 16-bit
    /// coordinate space.
    pub async fn send_framebuffer_update_request(
        &self,
        rect: Rect,
        incremental: bool,
    ) -> Result<(), RfbError> {
        if rect.is_empty() {
            return Err(RfbError::InvalidArgument(format!(
                "empty update request {rect}"
            )));
        }
        if rect.right() > u32::from(u16::MAX) || rect.bottom() > u32::from(u16::MAX) {
            return Err(RfbError::InvalidArgument(format!(
                "update request {rect} exceeds 16-bit coordinates"
            )));
        }
        self.send(ClientMessage::FramebufferUpdateRequest { incremental, rect })
            .await
    }

    /// ClientCutText. Characters outside Latin-1 become `?`.
    pub async fn send_client_cut_text(&self, text: &str) -> Result<(), RfbError> {
        self.send(ClientMessage::ClientCutText(latin1_encode(text)))
            .await
    }

    /// SetPixelFormat. The receive side switches to the new format at the
    /// first framebuffer update that starts after the message is sent.
    ///
    /// While a requested update is still outstanding the message is held
    /// back and sent by the receive loop when that update ends. A later call
    /// replaces a held-back format.
    pub async fn send_set_pixel_format(&self, pixel_format: PixelFormat) -> Result<(), RfbError> {
        pixel_format
            .validate()
            .map_err(|reason| RfbError::InvalidArgument(format!("pixel format: {reason}")))?;
        let mut sink = self.lock_sink().await?;
        {
            let mut tracking = self.tracking();
            if tracking.awaiting_update {
                debug!(
                    format = %pixel_format,
                    "pixel format change waits for the outstanding update"
                );
                tracking.pending_format = Some(pixel_format);
                return Ok(());
            }
            tracking.pending_format = None;
        }
        self.switch_pixel_format(&mut sink, pixel_format).await
    }

    /// The pixel format most recently sent to the server.
    pub fn pixel_format(&self) -> PixelFormat {
        *self.inner.pixel_format.borrow()
    }

    /// A format change still waiting for an outstanding update.
    pub fn pending_pixel_format(&self) -> Option<PixelFormat> {
        self.tracking().pending_format
    }

    /// Mark the start of a framebuffer update. It answers every request
    /// sent before it.
    pub(crate) fn update_started(&self) {
        self.tracking().awaiting_update = false;
    }

    /// Send a held-back SetPixelFormat once no requested update is
    /// outstanding. Returns whether one went out.
    pub(crate) async fn flush_pending_pixel_format(&self) -> Result<bool, RfbError> {
        if self.tracking().pending_format.is_none() {
            return Ok(false);
        }
        let mut sink = self.lock_sink().await?;
        let pixel_format = {
            let mut tracking = self.tracking();
            if tracking.awaiting_update {
                return Ok(false);
            }
            match tracking.pending_format.take() {
                Some(pixel_format) => pixel_format,
                None => return Ok(false),
            }
        };
        self.switch_pixel_format(&mut sink, pixel_format).await?;
        Ok(true)
    }

    /// The watch changes before the message reaches the wire.
    async fn switch_pixel_format(
        &self,
        sink: &mut Sink,
        pixel_format: PixelFormat,
    ) -> Result<(), RfbError> {
        self.inner.pixel_format.send_replace(pixel_format);
        self.write(sink, ClientMessage::SetPixelFormat(pixel_format)).await
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, UpdateTracking> {
        self.inner.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn watch_pixel_format(&self) -> watch::Receiver<PixelFormat> {
        self.inner.pixel_format.subscribe()
    }

    /// Flush and shut down the write half. Idempotent.
    pub async fn close(&self) -> Result<(), RfbError> {
        let mut sink = self.inner.sink.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing write half");
        sink.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn coordinate(what: &str, value: i32) -> Result<u16, RfbError> {
    u16::try_from(value)
        .map_err(|_| RfbError::InvalidArgument(format!("{what} {value} outside 0..=65535")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn pair() -> (MessageSender, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (MessageSender::new(client, PixelFormat::bgra32()), server)
    }

    async fn read_n(server: &mut tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn pointer_event_bytes() {
        let (sender, mut server) = pair();
        sender
            .send_pointer_event(300, 2, ButtonMask::LEFT | ButtonMask::RIGHT)
            .await
            .unwrap();
        assert_eq!(read_n(&mut server, 6).await, [5, 0x05, 0x01, 0x2C, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn pointer_out_of_range_is_rejected_before_writing() {
        let (sender, mut server) = pair();
        for (x, y) in [(-1, 0), (0, 65_536), (i32::MAX, 5)] {
            let err = sender
                .send_pointer_event(x, y, ButtonMask::empty())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        sender.send_key_event(0xFF0D, true).await.unwrap();
        // Only the key event reached the wire.
        assert_eq!(read_n(&mut server, 8).await, [4, 1, 0, 0, 0, 0, 0xFF, 0x0D]);
        sender.send_pointer_event(65_535, 65_535, ButtonMask::empty()).await.unwrap();
        assert_eq!(read_n(&mut server, 6).await, [5, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn update_request_validation() {
        let (sender, mut server) = pair();
        assert!(sender
            .send_framebuffer_update_request(Rect::new(0, 0, 0, 10), false)
            .await
            .is_err());
        assert!(sender
            .send_framebuffer_update_request(Rect::new(65_000, 0, 1000, 10), false)
            .await
            .is_err());
        sender
            .send_framebuffer_update_request(Rect::new(1, 2, 3, 4), true)
            .await
            .unwrap();
        assert_eq!(read_n(&mut server, 10).await, [3, 1, 0, 1, 0, 2, 0, 3, 0, 4]);
    }

    #[tokio::test]
    async fn encodings_and_cut_text() {
        let (sender, mut server) = pair();
        sender.send_client_encodings(&[16, 0, -223]).await.unwrap();
        assert_eq!(
            read_n(&mut server, 16).await,
            [2, 0, 0, 3, 0, 0, 0, 16, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0x21]
        );
        sender.send_client_cut_text("é€").await.unwrap();
        assert_eq!(read_n(&mut server, 10).await, [6, 0, 0, 0, 0, 0, 0, 2, 0xE9, b'?']);
    }

    #[tokio::test]
    async fn set_pixel_format_updates_watch() {
        let (sender, mut server) = pair();
        let mut watch = sender.watch_pixel_format();
        let mut bad = PixelFormat::rgb565();
        bad.bits_per_pixel = 24;
        assert!(sender.send_set_pixel_format(bad).await.is_err());
        assert!(!watch.has_changed().unwrap());

        sender.send_set_pixel_format(PixelFormat::rgb565()).await.unwrap();
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), PixelFormat::rgb565());
        assert_eq!(sender.pixel_format(), PixelFormat::rgb565());
        let bytes = read_n(&mut server, 20).await;
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[4], 16);
    }

    #[tokio::test]
    async fn pixel_format_held_while_update_outstanding() {
        let (sender, mut server) = pair();
        let mut watch = sender.watch_pixel_format();
        sender
            .send_framebuffer_update_request(Rect::new(0, 0, 4, 4), false)
            .await
            .unwrap();
        sender.send_set_pixel_format(PixelFormat::rgb565()).await.unwrap();
        assert!(!watch.has_changed().unwrap());
        assert_eq!(sender.pending_pixel_format(), Some(PixelFormat::rgb565()));
        assert_eq!(sender.pixel_format(), PixelFormat::bgra32());

        // Nothing goes out until the answering update has started.
        assert!(!sender.flush_pending_pixel_format().await.unwrap());
        sender.update_started();
        assert!(sender.flush_pending_pixel_format().await.unwrap());
        assert!(!sender.flush_pending_pixel_format().await.unwrap());
        assert_eq!(*watch.borrow_and_update(), PixelFormat::rgb565());
        assert_eq!(sender.pending_pixel_format(), None);

        let bytes = read_n(&mut server, 30).await;
        assert_eq!(bytes[0], 3, "request first");
        assert_eq!(bytes[10], 0, "then SetPixelFormat");
        assert_eq!(bytes[14], 16);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (sender, mut server) = pair();
        let clone = sender.clone();
        sender.close().await.unwrap();
        sender.close().await.unwrap();
        assert!(clone.is_closed());
        let err = clone.send_key_event(1, true).await.unwrap_err();
        assert!(matches!(err, RfbError::ConnectionClosed));
        assert_eq!(err.kind(), ErrorKind::Transport);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn peer_gone_is_transport_error() {
        let (sender, server) = pair();
        drop(server);
        let err = sender.send_key_event(1, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(sender.is_closed());
    }
}
