//! RFB viewer entry point.
//!
//! ```text
//! rfb-viewer                        Connect with defaults
//! rfb-viewer --config <path>        Use custom config TOML
//! rfb-viewer --server host:5901     Override the server address
//! rfb-viewer --frames 10            Stop after ten frames
//! rfb-viewer --gen-config           Dump default config and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rfb_core::{ConnectionInfo, RfbProtocol, SessionEvent};
use rfb_viewer::config::ViewerConfig;
use rfb_viewer::snapshot;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rfb-viewer", about = "Headless RFB (VNC) viewer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rfb-viewer.toml")]
    config: PathBuf,

    /// Server address (overrides config). Example: 192.168.1.100:5900
    #[arg(short, long)]
    server: Option<String>,

    /// VNC password (overrides config).
    #[arg(short, long)]
    password: Option<String>,

    /// Snapshot output path (overrides config).
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Stop after this many frames (overrides config).
    #[arg(long)]
    frames: Option<u64>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ViewerConfig::load(&cli.config);
    if let Some(addr) = cli.server {
        config.network.server_address = addr;
    }
    if let Some(password) = cli.password {
        config.session.password = password;
    }
    if let Some(path) = cli.snapshot {
        config.capture.snapshot_path = path.display().to_string();
    }
    if let Some(frames) = cli.frames {
        config.capture.frames = frames;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rfb-viewer v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Connect ──────────────────────────────────────────────

    let info: ConnectionInfo = config.network.server_address.parse()?;
    let protocol = RfbProtocol::default();
    let mut conn = protocol.connect(&info, config.session_config()).await?;
    info!(
        "connected to {:?} ({}, {})",
        conn.server_name(),
        conn.frame_size(),
        conn.version()
    );

    // ── 2. Follow the session ───────────────────────────────────

    let mut frames = 0u64;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = conn.next_event() => event,
        };
        let Some(event) = event else { break };
        match event {
            SessionEvent::FrameReady {
                generation,
                size,
                rectangles,
            } => {
                frames += 1;
                tracing::debug!(generation, %size, rectangles, "frame {frames}");
                if config.capture.frames > 0 && frames >= config.capture.frames {
                    info!("received {frames} frames");
                    break;
                }
            }
            SessionEvent::Resized(size) => info!("desktop resized to {size}"),
            SessionEvent::Bell => info!("bell"),
            SessionEvent::ServerCutText(text) => info!("server clipboard: {} chars", text.chars().count()),
            SessionEvent::ColourMapUpdated { first, count } => {
                tracing::debug!(first, count, "colour map updated")
            }
            SessionEvent::Closed => {
                info!("server closed the session");
                break;
            }
            SessionEvent::Failed(e) => {
                error!("session failed: {e}");
                break;
            }
        }
    }

    // ── 3. Snapshot and shutdown ────────────────────────────────

    let stats = conn.stats().borrow().clone();
    info!(
        "{} updates, {} rectangles, {} bytes, {:.1} fps",
        stats.updates, stats.rectangles, stats.bytes, stats.fps
    );

    if !config.capture.snapshot_path.is_empty() && stats.updates > 0 {
        let source = conn.framebuffer().clone();
        let size = conn.frame_size();
        let path = PathBuf::from(&config.capture.snapshot_path);
        match tokio::task::spawn_blocking(move || snapshot::save(&source, size, &path)).await? {
            Ok(()) => {}
            Err(e) => warn!("snapshot failed: {e}"),
        }
    }

    conn.close().await;
    info!("shutting down");
    Ok(())
}
