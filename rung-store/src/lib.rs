//! Rung Storage Layer
//!
//! Persistence for master position records and retired-position history.
//!
//! # Architecture
//!
//! - `PositionStore`: version-checked repository trait (port)
//! - `MemoryStore`: in-memory implementation for tests and dry runs
//! - `JsonFileStore`: single-document JSON file, atomic rewrite per write
//! - `JsonlHistory`: append-only history sink
//!
//! All writers go through [`modify_with_retry`], which turns the store's
//! compare-and-swap into a read-modify-write loop.

#![warn(clippy::all)]

pub mod error;
pub mod history;
pub mod json_file;
pub mod memory;
pub mod repository;

pub use error::StoreError;
pub use history::JsonlHistory;
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use repository::{modify_with_retry, Modified, PositionStore};
