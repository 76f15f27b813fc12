//! Lumina Call CLI
//!
//! Startet einen Anruf mit der simulierten Gegenstelle über die Systemgeräte
//! und legt bei Ctrl-C auf.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lumina_call::call_engine::CAMERA_SUPPORTED;
use lumina_call::{CallConfig, CallEngine, CallEvent, MediaKind, RemoteParty};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Live call with a simulated remote party", long_about = None)]
struct Args {
    /// Name der Gegenstelle
    #[arg(short, long)]
    peer: String,

    /// Videoanruf (Kamera an)
    #[arg(
        long,
        help = "Video call; requires a build with `--features camera`"
    )]
    video: bool,

    /// Stumm starten
    #[arg(long)]
    muted: bool,

    /// Alternative Konfigurationsdatei
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    lumina_call::init_logging();
    let args = Args::parse();

    if args.video && !CAMERA_SUPPORTED {
        bail!("--video needs camera support; rebuild with `--features camera`");
    }

    let config = match &args.config {
        Some(path) => {
            let mut config = CallConfig::load_from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            config.apply_env();
            config.validate()?;
            config
        }
        None => CallConfig::load().context("failed to load config")?,
    };

    let engine = CallEngine::with_defaults(config)?;
    let mut events = engine.subscribe();

    let kind = if args.video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let call_id = engine.start_call(RemoteParty::new(&args.peer), kind).await?;
    engine.set_muted(args.muted);
    tracing::info!("Call {} started, press Ctrl-C to hang up", call_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received");
                if let Err(e) = engine.hang_up().await {
                    tracing::warn!("Hang-up failed: {}", e);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged { state, .. }) => {
                    tracing::info!("Call state: {}", state);
                    if state.is_terminal() {
                        break;
                    }
                }
                Ok(CallEvent::Notification { message, error, .. }) => {
                    tracing::error!("{} ({})", message, error);
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} call events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    tracing::info!("Call finished: {:?}", engine.stats());
    Ok(())
}
