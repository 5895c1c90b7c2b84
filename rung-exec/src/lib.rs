//! Rung Execution Layer
//!
//! Ports to the outside world and the adapters that need no network.
//!
//! # Components
//!
//! - **Ports**: Traits for the exchange, market data, notifications and history
//! - **Stub**: Scriptable exchange and market data for tests and dry runs
//! - **Sinks**: Log/recording notifiers and an in-memory history sink
//!
//! # Example
//!
//! ```rust,ignore
//! use rung_exec::{ExchangePort, StubExchange};
//!
//! let exchange = StubExchange::new();
//! exchange.set_positions(vec![live_position]);
//! let positions = exchange.list_open_positions().await?;
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod ports;
pub mod sinks;
pub mod stub;

// Re-exports for convenience
pub use error::{ExecError, ExecResult, RejectionKind};
pub use ports::{
    CancelOutcome, ClosedPosition, ExchangePort, HistorySink, MarketDataPort, Notifier, OrderAck,
    OrderKind, OrderRequest, PriceUpdate, StopLossLeg, TakeProfitLeg, TpSlRequest,
};
pub use sinks::{notify_best_effort, record_best_effort, LogNotifier, MemoryHistory, RecordingNotifier};
pub use stub::{StubExchange, StubFailure, StubMarketData, StubOp};
