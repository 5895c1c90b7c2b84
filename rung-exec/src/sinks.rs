//! Notification and history sink adapters that need no external service.
//!
//! Both sinks are best-effort from the core's point of view: use
//! [`notify_best_effort`] and [`record_best_effort`] so a failing sink is
//! logged and never propagates.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ExecResult;
use crate::ports::{ClosedPosition, HistorySink, Notifier};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Send a notification, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, title: &str, text: &str) {
    if let Err(e) = notifier.notify(title, text).await {
        warn!(error = %e, %title, "Notification failed");
    }
}

/// Record history, logging instead of failing.
pub async fn record_best_effort(history: &dyn HistorySink, record: &ClosedPosition) {
    if let Err(e) = history.record_closed(record).await {
        warn!(
            error = %e,
            position_id = %record.position.id,
            symbol = %record.position.symbol,
            "History capture failed"
        );
    }
}

// =============================================================================
// Notifiers
// =============================================================================

/// Notifier that only writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, text: &str) -> ExecResult<()> {
        info!(%title, %text, "Notification");
        Ok(())
    }
}

/// Notifier that keeps every message (tests).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(title, text)` pairs in delivery order.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    /// Titles only.
    pub fn titles(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|(title, _)| title.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, text: &str) -> ExecResult<()> {
        lock(&self.sent).push((title.to_string(), text.to_string()));
        Ok(())
    }
}

// =============================================================================
// History
// =============================================================================

/// In-memory history sink.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<ClosedPosition>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ClosedPosition> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn record_closed(&self, record: &ClosedPosition) -> ExecResult<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
