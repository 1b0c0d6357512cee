//! Standalone relay server.
//!
//! `DIAGRAM_RELAY_ADDR` overrides the bind address (default `127.0.0.1:9090`).
//! Ctrl-C closes every connection and exits.

use std::sync::Arc;

use diagram_sync::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("DIAGRAM_RELAY_ADDR") {
        config.bind_addr = addr;
    }

    let server = Arc::new(RelayServer::new(config));
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await
}
