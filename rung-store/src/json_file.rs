//! JSON file store
//!
//! Keeps every master record in one JSON document on disk. Reads are served
//! from an in-memory cache; every write rewrites the document through a
//! temporary file and a rename, so a crash never leaves a half-written file.
//!
//! Records written by older tooling use camelCase names and may miss fields.
//! They are loaded through [`StoredPosition`], which accepts both layouts and
//! normalizes the ladder bookkeeping before the record enters the cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rung_domain::{Position, PositionId, PositionStatus, Price, Side, Symbol};

use crate::error::StoreError;
use crate::memory::{apply_insert, apply_remove, apply_update};
use crate::repository::PositionStore;

/// On-disk document
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    positions: Vec<StoredPosition>,
}

/// Loose on-disk shape of a master record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StoredPosition {
    #[serde(default = "Uuid::now_v7")]
    id: Uuid,
    symbol: Symbol,
    #[serde(alias = "direction")]
    side: Side,
    #[serde(default)]
    status: Option<PositionStatus>,

    #[serde(default, alias = "avgEntryPrice")]
    avg_entry_price: Option<Price>,
    #[serde(default, alias = "totalQty")]
    total_qty: Decimal,
    #[serde(default, alias = "currentQty")]
    current_qty: Decimal,

    #[serde(default, alias = "sl")]
    stop_loss: Option<Price>,
    #[serde(default, alias = "slPlaced")]
    sl_placed: bool,

    #[serde(default, alias = "originalTargets")]
    targets: Vec<Price>,
    #[serde(default, alias = "allocatedTpQty")]
    allocated_qty_per_level: Vec<Decimal>,
    #[serde(default, alias = "nextTpIndex")]
    next_level_index: usize,

    #[serde(default, alias = "pendingEntryCount")]
    pending_entry_count: Option<u32>,
    #[serde(default, alias = "positionId")]
    exchange_position_id: Option<String>,
    #[serde(default, alias = "removalRequested")]
    removal_requested: bool,

    #[serde(default)]
    version: u64,
    #[serde(default)]
    qty_synced_at: Option<DateTime<Utc>>,

    #[serde(default, alias = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "lastUpdated")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default, alias = "closedAt")]
    closed_at: Option<DateTime<Utc>>,

    /// Older tooling mixed non-master entries into the same file
    #[serde(default = "default_master", alias = "isMaster", skip_serializing)]
    is_master: bool,
}

fn default_master() -> bool {
    true
}

impl StoredPosition {
    /// Normalize into a valid `Position`.
    fn into_position(self) -> Position {
        let now = Utc::now();
        let levels = self.targets.len();

        let mut allocations = self.allocated_qty_per_level;
        allocations.resize(levels, Decimal::ZERO);
        for slot in allocations.iter_mut() {
            *slot = (*slot).max(Decimal::ZERO);
        }

        let status = self.status.unwrap_or(if self.closed_at.is_some() {
            PositionStatus::Closed
        } else if self.current_qty > Decimal::ZERO {
            PositionStatus::Open
        } else {
            PositionStatus::PendingFill
        });

        let created_at = self.created_at.unwrap_or(now);
        let mut position = Position {
            id: self.id,
            symbol: self.symbol,
            side: self.side,
            status,
            avg_entry_price: self.avg_entry_price,
            total_qty: self.total_qty,
            current_qty: self.current_qty.max(Decimal::ZERO),
            stop_loss: self.stop_loss,
            sl_placed: self.sl_placed,
            targets: self.targets,
            allocated_qty_per_level: allocations,
            next_level_index: self.next_level_index.min(levels),
            pending_entry_count: self.pending_entry_count,
            exchange_position_id: self.exchange_position_id.filter(|s| !s.is_empty()),
            removal_requested: self.removal_requested,
            version: self.version.max(1),
            qty_synced_at: self.qty_synced_at,
            created_at,
            last_updated: self.last_updated.unwrap_or(created_at),
            closed_at: self.closed_at,
        };
        position.clamp_allocations();
        position
    }
}

impl From<&Position> for StoredPosition {
    fn from(p: &Position) -> Self {
        Self {
            id: p.id,
            symbol: p.symbol.clone(),
            side: p.side,
            status: Some(p.status),
            avg_entry_price: p.avg_entry_price,
            total_qty: p.total_qty,
            current_qty: p.current_qty,
            stop_loss: p.stop_loss,
            sl_placed: p.sl_placed,
            targets: p.targets.clone(),
            allocated_qty_per_level: p.allocated_qty_per_level.clone(),
            next_level_index: p.next_level_index,
            pending_entry_count: p.pending_entry_count,
            exchange_position_id: p.exchange_position_id.clone(),
            removal_requested: p.removal_requested,
            version: p.version,
            qty_synced_at: p.qty_synced_at,
            created_at: Some(p.created_at),
            last_updated: Some(p.last_updated),
            closed_at: p.closed_at,
            is_master: true,
        }
    }
}

/// Position store persisted to a single JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<PositionId, Position>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing records.
    ///
    /// A missing file is an empty store; it is created on the first write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => parse_document(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No store file yet, starting empty");
                BTreeMap::new()
            },
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), positions = records.len(), "Position store opened");
        Ok(Self {
            path,
            cache: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<PositionId, Position>) -> Result<(), StoreError> {
        let document = Document {
            positions: records.values().map(StoredPosition::from).collect(),
        };
        let body = serde_json::to_vec_pretty(&document)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `op` to a scratch copy and commit it only once the file is written.
    async fn write_through<T>(
        &self,
        op: impl FnOnce(&mut BTreeMap<PositionId, Position>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut cache = self.cache.lock().await;
        let mut next = cache.clone();
        let out = op(&mut next)?;
        self.persist(&next).await?;
        *cache = next;
        Ok(out)
    }
}

/// Parse either `{"positions": [...]}` or a bare array of records.
fn parse_document(raw: &str) -> Result<BTreeMap<PositionId, Position>, StoreError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let entries = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("positions") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => return Err(StoreError::Serialization("unexpected document root".to_string())),
    };

    let mut records = BTreeMap::new();
    for entry in entries {
        match serde_json::from_value::<StoredPosition>(entry) {
            Ok(stored) if !stored.is_master => continue,
            Ok(stored) => {
                let position = stored.into_position();
                records.insert(position.id, position);
            },
            Err(e) => warn!(error = %e, "Skipping unreadable position record"),
        }
    }
    Ok(records)
}

#[async_trait]
impl PositionStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.cache.lock().await.values().cloned().collect())
    }

    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        Ok(self.cache.lock().await.get(&id).cloned())
    }

    async fn insert(&self, position: &Position) -> Result<Position, StoreError> {
        self.write_through(|map| apply_insert(map, position)).await
    }

    async fn update(&self, position: &Position) -> Result<Position, StoreError> {
        self.write_through(|map| apply_update(map, position)).await
    }

    async fn remove(&self, id: PositionId, expected_version: u64) -> Result<(), StoreError> {
        self.write_through(|map| apply_remove(map, id, expected_version)).await
    }
}

// =============================================================================
// Tests
// =============================================================================
