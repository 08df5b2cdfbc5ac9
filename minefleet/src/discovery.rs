//! Network discovery of unmanaged devices.
//!
//! A scan connects to the configured port on every address of the
//! configured ranges. Hosts that answer and are not already known are
//! added to the store disabled, for an operator to review and enable.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::types::DeviceType;

/// Upper bound on addresses per range, to keep a typo from scanning a /8.
const MAX_RANGE_HOSTS: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// `a.b.c.d` or `a.b.c.d-e.f.g.h`, inclusive.
    pub ranges: Vec<String>,
    pub port: u16,
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
    /// Type and driver assigned to discovered devices.
    pub device_type: DeviceType,
    pub driver: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            port: 80,
            concurrency: 32,
            connect_timeout_ms: 500,
            device_type: DeviceType::Bitaxe,
            driver: "simulated".to_string(),
        }
    }
}

/// Expand one range expression into addresses.
pub fn parse_range(range: &str) -> Result<Vec<Ipv4Addr>> {
    let bad = |why: &str| Error::Config(format!("discovery range {range:?}: {why}"));
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (range.trim(), range.trim()),
    };
    let start: Ipv4Addr = start.parse().map_err(|_| bad("bad start address"))?;
    let end: Ipv4Addr = end.parse().map_err(|_| bad("bad end address"))?;
    let (start, end) = (u32::from(start), u32::from(end));
    if end < start {
        return Err(bad("end is before start"));
    }
    if end - start >= MAX_RANGE_HOSTS {
        return Err(bad("range too large"));
    }
    Ok((start..=end).map(Ipv4Addr::from).collect())
}

/// Addresses of every configured range, in order, without duplicates.
pub fn targets(config: &DiscoveryConfig) -> Result<Vec<Ipv4Addr>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for range in &config.ranges {
        for addr in parse_range(range)? {
            if seen.insert(addr) {
                out.push(addr);
            }
        }
    }
    Ok(out)
}

/// Probe every target, returning the addresses that accepted a
/// connection. Order follows the input.
pub async fn sweep(
    addrs: Vec<Ipv4Addr>,
    port: u16,
    concurrency: usize,
    timeout: Duration,
) -> Vec<Ipv4Addr> {
    let found: Vec<Option<Ipv4Addr>> = stream::iter(addrs)
        .map(|addr| async move {
            let connect = TcpStream::connect(SocketAddr::from((addr, port)));
            matches!(tokio::time::timeout(timeout, connect).await, Ok(Ok(_))).then_some(addr)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;
    found.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use tokio::net::TcpListener;

    #[test_case("10.0.0.5", 1; "single")]
    #[test_case("10.0.0.250-10.0.1.4", 11; "crosses octet")]
    #[test_case(" 192.168.1.1 - 192.168.1.3 ", 3; "whitespace")]
    fn ranges_expand(range: &str, count: usize) {
        assert_eq!(parse_range(range).unwrap().len(), count);
    }

    #[test_case("10.0.0.9-10.0.0.1"; "reversed")]
    #[test_case("10.0.0.0-10.255.255.255"; "too large")]
    #[test_case("not-an-ip"; "garbage")]
    fn bad_ranges(range: &str) {
        assert!(matches!(parse_range(range), Err(Error::Config(_))));
    }

    #[test]
    fn targets_are_deduplicated() {
        let config = DiscoveryConfig {
            ranges: vec!["10.0.0.1-10.0.0.3".into(), "10.0.0.2".into()],
            ..Default::default()
        };
        assert_eq!(targets(&config).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sweep_finds_listening_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let found = sweep(
            vec![Ipv4Addr::LOCALHOST],
            port,
            4,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(found, [Ipv4Addr::LOCALHOST]);
    }
}
