//! Rung Daemon Library
//!
//! Runtime for the position reconciliation and take-profit ladder engine.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────── Coordinator ────────────┐
//!                 │  store · exchange · market data     │
//!                 │  ladder · thresholds · event bus    │
//!                 └──────┬──────────────┬───────────────┘
//!                        │              │
//!     interval ──▶ Reconciler     PriceMonitor ◀── price stream
//!                        │              │
//!                        └──▶ PositionStore (versioned) ◀──┘
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Reconciler**: Periodic sync with the exchange; ladder and stop placement
//! - **Price Monitor**: Stop-loss and take-profit triggers on live prices
//! - **Desk**: Manual entry placement and closes
//! - **Event Bus**: Internal communication between the two loops
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use rungd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::from_config(config).await.expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod desk;
pub mod error;
pub mod event_bus;
pub mod price_monitor;
pub mod reconciler;

// Re-exports for convenience
pub use config::{
    Config, Environment, ExchangeConfig, LadderConfig, MonitorConfig, NotifyConfig, ReconcileConfig,
    StoreConfig,
};
pub use coordinator::{Adapters, Coordinator, ExitClaim};
pub use daemon::Daemon;
pub use desk::{CloseSummary, ClosedExposure, Desk, EntryOrder, OpenOutcome, OpenRequest};
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{DaemonEvent, EventBus, EventReceiver};
pub use price_monitor::PriceMonitor;
pub use reconciler::{PositionOutcome, PositionReport, Reconciler, TickGuard, TickPermit, TickReport};
