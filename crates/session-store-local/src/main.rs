use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use session_store_core::{SessionHandler, SessionStorage};
use tracing::info;
use tracing_subscriber::EnvFilter;

use session_store_local::config::{Command, Config};
use session_store_local::LocalStorage;

/// Session name reported to the handler for every cycle.
const SESSION_NAME: &str = "session-store-local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is reserved for payloads
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let dir = config.effective_storage_dir();

    info!("Starting session-store-local");
    info!("  Storage dir: {}", dir.display());
    info!("  Node id: {}", config.node_id);

    let storage: Arc<dyn SessionStorage> = Arc::new(LocalStorage::new(&dir, config.node_id));
    let session_id = config.command.session_id().unwrap_or_default();
    let mut handler =
        SessionHandler::new(storage, session_id).with_config(config.handler_config());

    let save_path = dir.to_string_lossy().into_owned();
    match &config.command {
        Command::Read { session_id } => {
            handler.open(&save_path, SESSION_NAME).await?;
            let result = handler.read(session_id).await;
            handler.close().await?;

            std::io::stdout().write_all(&result?)?;
        }
        Command::Write {
            session_id,
            payload,
        } => {
            let payload = match payload {
                Some(payload) => payload.clone().into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };

            handler.open(&save_path, SESSION_NAME).await?;
            // Read first so an unchanged payload can be elided
            let result = match handler.read(session_id).await {
                Ok(_) => handler.write(session_id, &payload).await,
                Err(e) => Err(e),
            };
            handler.close().await?;

            let outcome = result?;
            info!("Write outcome: {:?} ({} bytes)", outcome, payload.len());
        }
        Command::Destroy { session_id } => {
            handler.open(&save_path, SESSION_NAME).await?;
            let result = handler.destroy(session_id).await;
            // No-op when destroy already released the lock
            handler.close().await?;
            result?;
            info!("Session destroyed");
        }
        Command::Gc { max_lifetime } => {
            let removed = handler.gc(Duration::from_secs(*max_lifetime)).await?;
            println!("{}", removed);
        }
    }

    Ok(())
}
