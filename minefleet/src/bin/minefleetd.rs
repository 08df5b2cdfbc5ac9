//! Fleet control daemon.
//!
//! Loads the fleet configuration, starts every scheduled job and serves
//! the HTTP API until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use minefleet::api::{self, SharedState};
use minefleet::config::FleetConfig;
use minefleet::context::FleetContext;
use minefleet::jobs;
use minefleet::scheduler::Scheduler;
use minefleet::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = FleetConfig::from_env().context("loading configuration")?;
    for warning in config.validate().context("validating configuration")? {
        warn!("{warning}");
    }
    info!(
        devices = config.devices.len(),
        pools = config.pools.len(),
        bands = config.bands.len(),
        rules = config.rules.len(),
        "Configuration loaded"
    );

    let ctx = Arc::new(FleetContext::from_config(&config)?);
    let scheduler = Arc::new(Scheduler::new(ctx.store().clone()));
    jobs::register_all(&scheduler, &ctx, &config.intervals)?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(api::serve(
        config.api_addr.clone(),
        SharedState {
            ctx: ctx.clone(),
            scheduler: scheduler.clone(),
        },
        shutdown.clone(),
    ));

    let exited = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Shutting down");
            None
        }
        result = &mut server => Some(result),
    };

    shutdown.cancel();
    scheduler.shutdown().await;
    ctx.settle().await;
    match exited {
        Some(result) => result??,
        None => server.await??,
    }
    info!("Stopped");
    Ok(())
}
