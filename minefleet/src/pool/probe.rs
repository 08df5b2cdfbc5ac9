use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{Pool, PoolConfig};
use crate::tracing::prelude::*;

/// What a single reachability probe saw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub latency: Option<Duration>,
}

impl ProbeOutcome {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            latency: None,
        }
    }

    pub fn reachable(latency: Duration) -> Self {
        Self {
            reachable: true,
            latency: Some(latency),
        }
    }
}

#[async_trait]
pub trait PoolProbe: Send + Sync {
    async fn probe(&self, pool: &Pool) -> ProbeOutcome;
}

/// Measures TCP connect time to the pool's stratum port.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PoolProbe for TcpProbe {
    async fn probe(&self, pool: &Pool) -> ProbeOutcome {
        let started = Instant::now();
        let connect = TcpStream::connect((pool.host(), pool.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => ProbeOutcome::reachable(started.elapsed()),
            Ok(Err(e)) => {
                debug!(pool = %pool.id, error = %e, "Pool connect failed");
                ProbeOutcome::unreachable()
            }
            Err(_) => {
                debug!(pool = %pool.id, timeout = ?self.timeout, "Pool connect timed out");
                ProbeOutcome::unreachable()
            }
        }
    }
}

/// Score a probe in [0, 100].
///
/// Unreachable pools score 0. Otherwise latency and reject rate each map
/// linearly from 100 down to 0 at their configured zero point and are
/// blended by `latency_weight`. Without a reject rate the latency score
/// stands alone.
pub fn pool_score(config: &PoolConfig, outcome: &ProbeOutcome, reject_rate: Option<f64>) -> f64 {
    if !outcome.reachable {
        return 0.0;
    }

    let latency_ms = outcome.latency.map_or(0.0, |l| l.as_secs_f64() * 1000.0);
    let latency_score =
        100.0 * (1.0 - latency_ms / config.latency_zero_score_ms.max(1.0)).clamp(0.0, 1.0);

    match reject_rate {
        Some(rate) => {
            let reject_score = 100.0
                * (1.0 - rate / config.reject_rate_zero_score.max(f64::EPSILON)).clamp(0.0, 1.0);
            let w = config.latency_weight.clamp(0.0, 1.0);
            w * latency_score + (1.0 - w) * reject_score
        }
        None => latency_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn unreachable_scores_zero() {
        let config = PoolConfig::default();
        assert_eq!(pool_score(&config, &ProbeOutcome::unreachable(), Some(0.0)), 0.0);
    }

    #[test]
    fn score_blends_latency_and_rejects() {
        let config = PoolConfig::default();
        let fast = ProbeOutcome::reachable(Duration::ZERO);
        assert_eq!(pool_score(&config, &fast, None), 100.0);
        assert_eq!(pool_score(&config, &fast, Some(0.0)), 100.0);

        // Half the latency budget and half the reject budget.
        let half = ProbeOutcome::reachable(Duration::from_millis(500));
        let score = pool_score(&config, &half, Some(0.05));
        assert!((score - 50.0).abs() < 1e-9, "score {score}");

        let awful = ProbeOutcome::reachable(Duration::from_secs(10));
        assert_eq!(pool_score(&config, &awful, Some(1.0)), 0.0);
    }

    #[tokio::test]
    async fn tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = Pool::new("local", "stratum+tcp://127.0.0.1", port);

        let outcome = TcpProbe::new(Duration::from_secs(2)).probe(&pool).await;
        assert!(outcome.reachable);
        assert!(outcome.latency.is_some());
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_connection() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = Pool::new("gone", "127.0.0.1", port);
        let outcome = TcpProbe::new(Duration::from_secs(2)).probe(&pool).await;
        assert_eq!(outcome, ProbeOutcome::unreachable());
    }
}
