//! Closed-position history as append-only JSON lines.
//!
//! One [`ClosedPosition`] per line. A torn final line only loses that entry;
//! [`JsonlHistory::read_all`] skips lines it cannot parse.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rung_exec::{ClosedPosition, ExecError, ExecResult, HistorySink};

use crate::error::StoreError;

/// JSONL history file
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    // Serializes appends from concurrent retirements
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub async fn append(&self, record: &ClosedPosition) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(
            position_id = %record.position.id,
            symbol = %record.position.symbol,
            "History entry appended"
        );
        Ok(())
    }

    /// Every readable record, oldest first. A missing file is empty history.
    pub async fn read_all(&self) -> Result<Vec<ClosedPosition>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ClosedPosition>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed history line"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl HistorySink for JsonlHistory {
    async fn record_closed(&self, record: &ClosedPosition) -> ExecResult<()> {
        self.append(record).await.map_err(|e| ExecError::Sink(e.to_string()))
    }
}
