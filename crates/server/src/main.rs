//! kbstore server entry point.
//!
//! Loads configuration, opens the store, applies pending migrations, then
//! serves the MCP tools on stdio. Logging goes to stderr to avoid interfering
//! with the JSON-RPC protocol on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use kbstore_core::migrations::ExecuteOptions;
use kbstore_core::{AppConfig, ExecutionCoordinator};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod error;
mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    let coordinator = Arc::new(ExecutionCoordinator::open(&config).await.context("opening store")?);
    let migrations = Arc::new(coordinator.migrations(&config.migrations).await?);

    if config.migrations.run_on_startup {
        let report = migrations
            .migrate_to_latest(ExecuteOptions::default())
            .await
            .context("running startup migrations")?
            .into_result()?;
        tracing::info!(version = report.final_version, applied = report.migrations.len(), "store schema is current");
    }

    tracing::info!(path = %config.store.path.display(), "Starting kbstore server on stdio transport");

    let handler = handler::KbStoreServer::new(Arc::clone(&coordinator), migrations);
    let server = serve_server(handler, stdio()).await?;
    server.waiting().await?;

    coordinator.shutdown().await;
    Ok(())
}
