//! Logging setup and the macro prelude used across the crate.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod prelude {
    pub use ::tracing::{debug, error, info, trace, warn};
}

/// Install the global subscriber.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald with their
/// structured fields intact. Everywhere else they are formatted to stdout
/// with local timestamps. `RUST_LOG` controls filtering; the default is
/// `info`.
pub fn init_journald_or_stdout() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(journald)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to connect to journald ({e}), logging to stdout");
            }
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::LocalTime::rfc_3339()))
        .init();
}
