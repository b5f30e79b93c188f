//! Integration tests: full sessions against a scripted server over real
//! localhost TCP and in-memory duplex streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rfb_core::encoding::DecodeContext;
use rfb_core::protocol::auth::challenge_response;
use rfb_core::protocol::encodings;
use rfb_core::{
    ButtonMask, ConnectionInfo, ConnectionPhase, EncodingRegistry, ErrorKind, FrameSize,
    FramebufferSource, PixelFormat, Rect, RfbError, RfbProtocol, ServerInit, SessionConfig,
    SessionEvent,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

// ── Helpers ──────────────────────────────────────────────────────

const SETUP_LEN: usize = 20 + 4 + 4 * 7 + 10;

async fn ephemeral_listener() -> (TcpListener, ConnectionInfo) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
    (listener, info)
}

fn quiet_config() -> SessionConfig {
    SessionConfig {
        auto_refresh: false,
        ..SessionConfig::default()
    }
}

fn server_init(size: FrameSize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    ServerInit {
        size,
        pixel_format: PixelFormat::bgra32(),
        name: "scripted".into(),
    }
    .encode(&mut buf);
    buf.to_vec()
}

/// Server side of an RFB 3.8 handshake with security type None, followed
/// by the client's setup messages.
async fn accept_session<S>(stream: &mut S, size: FrameSize) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"RFB 003.008\n").await.unwrap();
    let mut banner = [0u8; 12];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"RFB 003.008\n");

    stream.write_all(&[1, 1]).await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), 1);
    stream.write_u32(0).await.unwrap();

    let _shared = stream.read_u8().await.unwrap();
    stream.write_all(&server_init(size)).await.unwrap();

    let mut setup = vec![0u8; SETUP_LEN];
    stream.read_exact(&mut setup).await.unwrap();
    setup
}

fn update(rects: &[(Rect, i32, &[u8])]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u16(rects.len() as u16);
    for (rect, encoding, body) in rects {
        buf.put_u16(rect.x);
        buf.put_u16(rect.y);
        buf.put_u16(rect.width);
        buf.put_u16(rect.height);
        buf.put_i32(*encoding);
        buf.put_slice(body);
    }
    buf.to_vec()
}

async fn next_event(conn: &mut rfb_core::Connection) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), conn.next_event())
        .await
        .expect("timeout")
        .expect("event channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ── End to end ───────────────────────────────────────────────────

#[tokio::test]
async fn test_raw_update_over_tcp() {
    let (listener, info) = ephemeral_listener().await;
    let pixels: Vec<u8> = (0..64u8).collect();

    let server = tokio::spawn({
        let pixels = pixels.clone();
        async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let setup = accept_session(&mut stream, FrameSize::new(4, 4)).await;
            stream
                .write_all(&update(&[(Rect::new(0, 0, 4, 4), encodings::RAW, &pixels)]))
                .await
                .unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            (setup, rest)
        }
    });

    let protocol = RfbProtocol::default();
    let mut conn = protocol.connect(&info, quiet_config()).await.unwrap();
    assert_eq!(conn.server_name(), "scripted");
    assert!(conn.phase().is_running());

    match next_event(&mut conn).await {
        SessionEvent::FrameReady {
            generation,
            size,
            rectangles,
        } => {
            assert_eq!(generation, 1);
            assert_eq!(size, FrameSize::new(4, 4));
            assert_eq!(rectangles, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    {
        let fb = conn.framebuffer().try_current().unwrap();
        assert_eq!(fb.data(), &pixels[..]);
    }

    conn.close().await;
    assert!(matches!(conn.phase(), ConnectionPhase::Closed));
    // Exactly one frame: only the close notification follows.
    assert!(matches!(next_event(&mut conn).await, SessionEvent::Closed));
    assert!(conn.next_event().await.is_none());

    let (setup, rest) = server.await.unwrap();
    assert_eq!(setup[0], 0, "SetPixelFormat first");
    assert_eq!(setup[20], 2, "then SetEncodings");
    assert_eq!(&setup[22..24], &[0, 7]);
    assert_eq!(&setup[52..], &[3, 0, 0, 0, 0, 0, 0, 4, 0, 4]);
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_vnc_authentication() {
    let (listener, info) = ephemeral_listener().await;
    let challenge: [u8; 16] = *b"0123456789abcdef";

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"RFB 003.008\n").await.unwrap();
        let mut banner = [0u8; 12];
        stream.read_exact(&mut banner).await.unwrap();
        stream.write_all(&[2, 1, 2]).await.unwrap();
        assert_eq!(stream.read_u8().await.unwrap(), 2);
        stream.write_all(&challenge).await.unwrap();
        let mut response = [0u8; 16];
        stream.read_exact(&mut response).await.unwrap();
        assert_eq!(response, challenge_response(&challenge, b"secret"));
        stream.write_u32(0).await.unwrap();
        let _shared = stream.read_u8().await.unwrap();
        stream
            .write_all(&server_init(FrameSize::new(2, 2)))
            .await
            .unwrap();
        let mut setup = vec![0u8; SETUP_LEN];
        stream.read_exact(&mut setup).await.unwrap();
        stream
    });

    let config = SessionConfig {
        password: Some("secret".into()),
        ..quiet_config()
    };
    let conn = RfbProtocol::default().connect(&info, config).await.unwrap();
    let _stream = server.await.unwrap();
    assert!(conn.phase().is_running());
    conn.close().await;
}

#[tokio::test]
async fn test_refused_auth_is_reported() {
    let (listener, info) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"RFB 003.008\n").await.unwrap();
        let mut banner = [0u8; 12];
        stream.read_exact(&mut banner).await.unwrap();
        stream.write_all(&[1, 2]).await.unwrap();
        let _ = stream.read_u8().await;
        stream.write_all(&[0; 16]).await.unwrap();
        let mut response = [0u8; 16];
        let _ = stream.read_exact(&mut response).await;
        stream.write_u32(1).await.unwrap();
        stream.write_u32(8).await.unwrap();
        stream.write_all(b"bad pass").await.unwrap();
    });

    let config = SessionConfig {
        password: Some("wrong".into()),
        ..quiet_config()
    };
    let err = RfbProtocol::default()
        .connect(&info, config)
        .await
        .unwrap_err();
    assert!(matches!(&err, RfbError::AuthFailed(reason) if reason == "bad pass"));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_connect_refused_port() {
    let (listener, info) = ephemeral_listener().await;
    drop(listener);
    let err = RfbProtocol::default()
        .connect(&info, quiet_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

// ── Failure path ─────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_encoding_fails_connection() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        accept_session(&mut server, FrameSize::new(4, 4)).await;
        server
            .write_all(&update(&[(Rect::new(0, 0, 1, 1), -9999, &[])]))
            .await
            .unwrap();
        server
    });

    let mut conn = RfbProtocol::default()
        .open(client, quiet_config())
        .await
        .unwrap();
    let _server = server.await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    conn.on_failure(move |err| {
        assert_eq!(err.kind(), ErrorKind::Protocol);
        counted.fetch_add(1, Ordering::SeqCst);
    });

    match next_event(&mut conn).await {
        SessionEvent::Failed(err) => {
            assert_eq!(err.kind(), ErrorKind::Protocol);
            assert!(matches!(*err, RfbError::UnknownEncoding(-9999)));
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    let phase = conn.phase();
    assert!(phase.is_terminal());
    assert!(matches!(
        phase.failure().map(|e| &**e),
        Some(RfbError::UnknownEncoding(-9999))
    ));

    conn.close().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resize_then_bounds() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        accept_session(&mut server, FrameSize::new(2, 2)).await;
        let inside = vec![0x42u8; 3 * 2 * 4];
        server
            .write_all(&update(&[
                (Rect::new(0, 0, 3, 2), encodings::DESKTOP_SIZE, &[]),
                (Rect::new(0, 0, 3, 2), encodings::RAW, &inside),
            ]))
            .await
            .unwrap();
        // One pixel past the right edge.
        server
            .write_all(&update(&[(Rect::new(1, 0, 3, 2), encodings::RAW, &inside)]))
            .await
            .unwrap();
        server
    });

    let mut conn = RfbProtocol::default()
        .open(client, quiet_config())
        .await
        .unwrap();
    let _server = server.await.unwrap();

    assert!(matches!(
        next_event(&mut conn).await,
        SessionEvent::Resized(s) if s == FrameSize::new(3, 2)
    ));
    match next_event(&mut conn).await {
        SessionEvent::FrameReady { size, rectangles, .. } => {
            assert_eq!(size, FrameSize::new(3, 2));
            assert_eq!(rectangles, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    match next_event(&mut conn).await {
        SessionEvent::Failed(err) => {
            assert!(matches!(*err, RfbError::RectOutOfBounds { .. }));
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }
        other => panic!("unexpected {other:?}"),
    }

    let fb = conn
        .grab_framebuffer_reference(FrameSize::new(3, 2))
        .unwrap();
    assert_eq!(fb.generation(), 1);
    assert!(fb.data().iter().all(|&b| b == 0x42));
}

#[tokio::test]
async fn test_server_close_is_clean() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        accept_session(&mut server, FrameSize::new(1, 1)).await;
        server.write_all(&[2]).await.unwrap();
    });

    let mut conn = RfbProtocol::default()
        .open(client, quiet_config())
        .await
        .unwrap();
    server.await.unwrap();

    assert!(matches!(next_event(&mut conn).await, SessionEvent::Bell));
    assert!(matches!(next_event(&mut conn).await, SessionEvent::Closed));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(conn.phase(), ConnectionPhase::Closed));
    conn.close().await;
}

// ── Close semantics ──────────────────────────────────────────────

#[tokio::test]
async fn test_close_stops_everything() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        accept_session(&mut server, FrameSize::new(2, 2)).await;
        server
    });

    let conn = RfbProtocol::default()
        .open(client, quiet_config())
        .await
        .unwrap();
    let mut server = server.await.unwrap();

    let sender = conn.sender().clone();
    sender
        .send_pointer_event(1, 1, ButtonMask::LEFT)
        .await
        .unwrap();
    let mut pointer = [0u8; 6];
    server.read_exact(&mut pointer).await.unwrap();
    assert_eq!(pointer, [5, 1, 0, 1, 0, 1]);

    conn.close().await;
    conn.close().await;
    assert!(matches!(conn.phase(), ConnectionPhase::Closed));
    assert!(conn.receiver_state().is_terminal());

    let err = sender.send_key_event(0x61, true).await.unwrap_err();
    assert!(matches!(err, RfbError::ConnectionClosed));
    let err = conn
        .grab_framebuffer_reference(FrameSize::new(2, 2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);

    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

// ── Codec determinism ────────────────────────────────────────────

#[test]
fn test_redecode_is_deterministic() {
    let registry = EncodingRegistry::with_defaults();
    let codec = registry.lookup(encodings::HEXTILE).unwrap();
    let rect = Rect::new(0, 0, 20, 18);

    // First tile sets both colours and two subrects; the other three
    // tiles reuse the background.
    let mut body = BytesMut::new();
    body.put_u8(0x02 | 0x04 | 0x08);
    body.put_slice(&[10, 20, 30, 0xFF]);
    body.put_slice(&[200, 100, 50, 0xFF]);
    body.put_u8(2);
    body.put_slice(&[0x00, 0x33]);
    body.put_slice(&[0x55, 0x11]);
    for _ in 0..3 {
        body.put_u8(0);
    }

    let decode = || {
        let source = FramebufferSource::new();
        let mut fb = source.acquire_blocking(FrameSize::new(20, 18)).unwrap();
        let mut ctx = DecodeContext::new(PixelFormat::bgra32());
        codec.decode(&body, rect, &mut ctx, &mut fb).unwrap();
        fb.data().to_vec()
    };
    let first = decode();
    assert_eq!(first, decode());
    assert_eq!(&first[..4], &[200, 100, 50, 0xFF]);
}
