//! Change stream server binary.
//!
//! Starts an in-process cluster, opens a change stream over it and logs every change until the
//! stream ends or the process is interrupted.

use ::config::shared::ServerConfig;
use telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_server_config;
use crate::core::start_server;

mod config;
mod core;

fn main() -> anyhow::Result<()> {
    let server_config = load_server_config()?;

    // Dropping the flusher would lose the tail of the log.
    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(server_config))?;

    Ok(())
}

async fn async_main(server_config: ServerConfig) -> anyhow::Result<()> {
    if let Err(err) = start_server(server_config).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
