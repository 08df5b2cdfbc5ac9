//! Command-line interface for minefleet.
//!
//! This binary talks to the daemon through its HTTP API.

use std::env;

use anyhow::{Result, bail};

use minefleet::api_client::{self, types::SettingsPatch};
use minefleet::jobs::JOB_NAMES;

fn usage() -> ! {
    eprintln!("Usage: minefleet-cli <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                  Show devices, pools and settings");
    eprintln!("  events [N]              Show the last N audit events (default 20)");
    eprintln!("  run <job>               Run a job now");
    eprintln!("  failover <device>       Move a device to its best failover pool");
    eprintln!("  restart <device>        Restart a device");
    eprintln!("  auto-optimize on|off    Toggle price-driven mode optimization");
    eprintln!();
    eprintln!("Jobs: {}", JOB_NAMES.join(", "));
    eprintln!();
    eprintln!("Environment:");
    eprintln!(
        "  MINEFLEET_API_URL    API base URL (default: {})",
        api_client::DEFAULT_BASE_URL
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let arg = |i: usize| args.get(i).map(String::as_str);
    match (args[1].as_str(), arg(2)) {
        ("status", None) => cmd_status().await?,
        ("events", limit) => {
            let limit = match limit {
                Some(n) => n.parse()?,
                None => 20,
            };
            cmd_events(limit).await?
        }
        ("run", Some(job)) => cmd_run(job).await?,
        ("failover", Some(device)) => cmd_failover(device).await?,
        ("restart", Some(device)) => {
            make_client().restart(device).await?;
            println!("{device}: restarted");
        }
        ("auto-optimize", Some("on")) => cmd_auto_optimize(true).await?,
        ("auto-optimize", Some("off")) => cmd_auto_optimize(false).await?,
        (command, _) => {
            eprintln!("Unknown command or missing argument: {command}");
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build an API client, honoring MINEFLEET_API_URL if set.
fn make_client() -> api_client::Client {
    match env::var("MINEFLEET_API_URL") {
        Ok(url) => api_client::Client::with_base_url(url),
        Err(_) => api_client::Client::new(),
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

async fn cmd_status() -> Result<()> {
    let client = make_client();
    let settings = client.get_settings().await?;
    let devices = client.get_devices().await?;
    let pools = client.get_pools().await?;

    println!(
        "Auto-optimize: {}",
        if settings.auto_optimize { "on" } else { "off" }
    );

    if devices.is_empty() {
        println!("Devices: (none)");
    } else {
        println!("Devices:");
        for device in &devices {
            let state = match (device.enabled, device.online) {
                (false, _) => "disabled",
                (true, None) => "unknown",
                (true, Some(true)) => "online",
                (true, Some(false)) => "offline",
            };
            let health = device
                .health
                .as_ref()
                .map(|h| format!("{:.0}", h.score));
            println!(
                "  - {:<16} {:<10} {:<8} mode={:<10} health={:<4} {:>8} GH/s  {}",
                device.id,
                device.device_type,
                state,
                or_dash(device.current_mode.as_deref()),
                or_dash(health),
                or_dash(device.hashrate_ghs.map(|h| format!("{h:.0}"))),
                or_dash(device.pool.as_deref()),
            );
            if let Some(health) = &device.health {
                if !health.reasons.is_empty() {
                    println!(
                        "      {} -> {}",
                        health.reasons.join(", "),
                        health.suggested_actions.join(", ")
                    );
                }
            }
        }
    }

    if !pools.is_empty() {
        println!("Pools:");
        for pool in &pools {
            println!(
                "  - {:<12} {}:{}  priority={} score={} {}",
                pool.id,
                pool.url,
                pool.port,
                pool.priority,
                or_dash(pool.rolling_score.map(|s| format!("{s:.0}"))),
                if pool.failing { "FAILING" } else { "" },
            );
        }
    }

    Ok(())
}

async fn cmd_events(limit: usize) -> Result<()> {
    for event in make_client().get_events(limit).await? {
        println!(
            "{} {:<8} {:<9} {:<12} {}",
            event.timestamp,
            event.severity,
            event.category,
            or_dash(event.device_id.as_deref()),
            event.message
        );
    }
    Ok(())
}

async fn cmd_run(job: &str) -> Result<()> {
    if !JOB_NAMES.contains(&job) {
        bail!("unknown job {job:?} (jobs: {})", JOB_NAMES.join(", "));
    }
    let state = make_client().run_job(job).await?;
    println!("{} finished", state.name);
    Ok(())
}

async fn cmd_failover(device: &str) -> Result<()> {
    let result = make_client().failover(device).await?;
    println!("{}: {}", result.device_id, result.outcome);
    Ok(())
}

async fn cmd_auto_optimize(enabled: bool) -> Result<()> {
    let patch = SettingsPatch {
        auto_optimize: Some(enabled),
        ..Default::default()
    };
    let settings = make_client().patch_settings(&patch).await?;
    println!(
        "Auto-optimize: {}",
        if settings.auto_optimize { "on" } else { "off" }
    );
    Ok(())
}
