// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standalone engine server.
//!
//! Loads configuration from the environment, wires the engine and runs until
//! Ctrl-C, logging observations as they arrive.

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tourguard_engine::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    info!(
        profile = ?config.profile,
        primary = %config.index.primary_addr,
        "starting tourguard engine"
    );

    let engine = Engine::builder().config(config).build().await?;

    // Log the observation stream for operators.
    let mut observations = engine.observations();
    tokio::spawn(async move {
        while let Ok(observation) = observations.recv().await {
            info!(kind = observation.kind(), ?observation, "observation");
        }
    });

    tokio::signal::ctrl_c().await?;
    warn!("interrupt received, shutting down");
    engine.shutdown().await?;
    Ok(())
}
