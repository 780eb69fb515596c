//! MangaHub sync backbone: TCP progress hub, UDP notifications, WebSocket
//! chat rooms and the protocol bridge in one process.
//!
//! Configuration comes from `MANGAHUB_*` environment variables; logging is
//! filtered with `RUST_LOG`.

use std::sync::Arc;

use log::info;
use mangahub_sync::{ChatHistory, InMemoryHistory, SyncConfig, SyncServices, TokenTable};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = SyncConfig::from_env();
    let tokens = TokenTable::parse(&std::env::var("MANGAHUB_TOKENS").unwrap_or_default());
    if tokens.is_empty() {
        log::warn!("MANGAHUB_TOKENS is empty; every chat connection will be rejected");
    }

    let history: Option<Arc<dyn ChatHistory>> = match config.history_per_room {
        0 => None,
        per_room => Some(Arc::new(InMemoryHistory::new(per_room))),
    };

    let services = SyncServices::start(config, Arc::new(tokens), history).await?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    services.shutdown().await;
    Ok(())
}
