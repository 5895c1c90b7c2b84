//! Rung Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains the position entity, value objects, and exchange snapshots.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod exchange;
#[allow(missing_docs)]
pub mod position;
pub mod value_objects;

// Re-export commonly used types
pub use exchange::{LivePosition, PendingOrder};
pub use position::{weighted_entry_price, Position, PositionId, PositionStatus};
pub use value_objects::{DomainError, OrderSide, Price, Quantity, Side, Symbol};
