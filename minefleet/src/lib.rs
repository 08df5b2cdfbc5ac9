//! Fleet control loop for network-attached mining devices.
//!
//! Polls device telemetry, learns mode-conditioned baselines, turns
//! deviations into health verdicts, and drives mode changes, pool
//! failover and alerts from automation rules and energy prices.

pub mod api;
pub mod api_client;
pub mod baseline;
pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod energy;
pub mod error;
pub mod health;
pub mod jobs;
pub mod notify;
pub mod pool;
pub mod price;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod tracing;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
