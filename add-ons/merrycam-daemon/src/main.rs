//! Merrycam voice daemon
//!
//! Runs one elf conversation on the local microphone and speaker until
//! CTRL-C or until the live service ends the session. `merrycam-daemon
//! devices` lists capture devices and exits.

use merrycam_voice::{CpalBackend, MicCapture, SessionManager, VoiceConfig};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[merrycam-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().nth(1).as_deref() == Some("devices") {
        for name in MicCapture::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = VoiceConfig::load()?;
    tracing::info!(
        model = %config.model,
        voice = %config.voice_name,
        transport = ?config.transport,
        "Merrycam voice daemon started"
    );

    let connector = config.connector()?;
    let manager = SessionManager::new(config, Arc::new(CpalBackend), connector);

    let closed = Arc::new(Notify::new());
    let notify = Arc::clone(&closed);
    if !manager.start(move || notify.notify_one()).await {
        return Err("voice session could not be started".into());
    }

    tokio::select! {
        _ = closed.notified() => {
            tracing::info!("Live service ended the session");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; stopping voice session");
        }
    }

    manager.stop().await;
    Ok(())
}
