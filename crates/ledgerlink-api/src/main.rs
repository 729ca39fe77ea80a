//! ledgerlinkd — inter-server communication daemon.
//!
//! Loads configuration, opens the store, starts the background loops, and
//! serves the receiver API until interrupted.

use ledgerlink_api::{receiver, ReceiverState};
use ledgerlink_comm::InterServerComm;
use ledgerlink_store::LinkStore;
use ledgerlink_types::config::CommConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LEDGERLINK_CONFIG").ok())
        .unwrap_or_else(|| "ledgerlink.toml".to_string());
    let config = CommConfig::load(&PathBuf::from(&config_path));

    let store = LinkStore::open(std::path::Path::new(&config.db_path))?;
    let listen = config.api_listen.clone();
    let comm = InterServerComm::new(config, store)?;
    comm.start()?;

    if let Err(e) = comm.register_with_supplier(None).await {
        info!(error = %e, "Initial registration deferred");
    }

    let state = ReceiverState::new(Arc::clone(&comm));
    let app = receiver::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(addr = %listen, server_id = %comm.identity().id, "Receiver API listening");

    let shutdown_comm = Arc::clone(&comm);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received, shutting down");
            shutdown_comm.shutdown();
        })
        .await?;

    Ok(())
}
