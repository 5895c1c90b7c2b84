//! Rung Exchange Connectors
//!
//! Adapters for the Bitunix futures API (REST + WebSocket) and the Join push
//! service. Each adapter implements one of the `rung-exec` ports.

#![warn(clippy::all)]

pub mod bitunix_rest;
pub mod bitunix_ws;
pub mod join;

pub use bitunix_rest::{BitunixRestClient, BitunixRestError};
pub use bitunix_ws::{BitunixTickerFeed, BitunixWsError};
pub use join::JoinNotifier;
