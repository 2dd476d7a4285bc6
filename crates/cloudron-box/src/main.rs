// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudron Box - App Lifecycle Orchestrator
//!
//! Runs the box:
//! - Resumes app pipelines interrupted by the last shutdown
//! - Restarts apps whose container died
//! - Runs the maintenance schedule (heartbeat, backups, updates, certificates)

use tracing::{info, warn};

use cloudron_box::config::Config;
use cloudron_box::runtime::BoxRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudron_box=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        fqdn = %config.fqdn,
        version = %config.box_version,
        data_dir = %config.data_dir.display(),
        dns_provider = %config.dns_provider,
        "Starting Cloudron Box"
    );

    let pool = cloudron_box::db::connect(&config.database_path).await?;
    info!(path = %config.database_path.display(), "Database ready");

    let runtime = BoxRuntime::builder()
        .config(config)
        .pool(pool)
        .build()?
        .start()
        .await?;

    info!("Box ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Cloudron Box shut down");

    Ok(())
}
