//! Rung Daemon
//!
//! Keeps tracked positions in sync with Bitunix, maintains their take-profit
//! ladders and stops, and closes on live price triggers.
//!
//! # Usage
//!
//! ```bash
//! # Dry run against stubs
//! RUNG_ENV=test cargo run -p rungd
//!
//! # Live
//! BITUNIX_API_KEY=... BITUNIX_API_SECRET=... cargo run -p rungd
//! ```
//!
//! # Environment Variables
//!
//! - `RUNG_ENV`: Environment (test, development, production)
//! - `RUNG_RECONCILE_INTERVAL_SECS`: Reconcile period (default: 30)
//! - `RUNG_TP_ALLOCATION`: Ladder schedule in percent (default: 30,30,20,10,5,5)
//! - `RUNG_TRIGGER_DEBOUNCE_MS`: Monitor debounce (default: 5000)
//! - `RUNG_STORE_PATH`: Position file (default: positions.json)
//! - `RUNG_LOG_JSON`: JSON log lines (default: false)

use rungd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first: it decides the log format
    let config = Config::from_env()?;

    let filter = EnvFilter::from_default_env().add_directive("rungd=info".parse()?);
    if config.log_json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        store = %config.store.path.display(),
        "Rung Daemon"
    );

    let daemon = Daemon::from_config(config).await?;
    daemon.run().await?;

    Ok(())
}
