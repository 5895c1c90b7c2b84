//! In-memory store implementation
//!
//! Used for testing and development without a disk file.
//! Thread-safe using a tokio RwLock; records are kept in a BTreeMap keyed
//! by their v7 UUID, so iteration order is creation order.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use rung_domain::{Position, PositionId};

use crate::error::StoreError;
use crate::repository::PositionStore;

/// In-memory position store
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: RwLock<BTreeMap<PositionId, Position>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records (version 1 each)
    pub fn with_positions(positions: impl IntoIterator<Item = Position>) -> Self {
        let map = positions
            .into_iter()
            .map(|mut p| {
                p.version = 1;
                (p.id, p)
            })
            .collect();
        Self {
            positions: RwLock::new(map),
        }
    }

    /// Get the number of positions
    pub async fn position_count(&self) -> usize {
        self.positions.read().await.len()
    }
}

/// Shared compare-and-swap rules used by the in-memory and file stores.
pub(crate) fn apply_insert(
    map: &mut BTreeMap<PositionId, Position>,
    position: &Position,
) -> Result<Position, StoreError> {
    if map.contains_key(&position.id) {
        return Err(StoreError::duplicate("position", position.id.to_string()));
    }
    position.validate()?;
    let mut stored = position.clone();
    stored.version = 1;
    map.insert(stored.id, stored.clone());
    Ok(stored)
}

pub(crate) fn apply_update(
    map: &mut BTreeMap<PositionId, Position>,
    position: &Position,
) -> Result<Position, StoreError> {
    let current = map
        .get(&position.id)
        .ok_or_else(|| StoreError::not_found("position", position.id.to_string()))?;
    if current.version != position.version {
        return Err(StoreError::VersionConflict {
            id: position.id,
            expected: position.version,
            actual: current.version,
        });
    }
    position.validate()?;
    let mut stored = position.clone();
    stored.version = current.version + 1;
    map.insert(stored.id, stored.clone());
    Ok(stored)
}

pub(crate) fn apply_remove(
    map: &mut BTreeMap<PositionId, Position>,
    id: PositionId,
    expected_version: u64,
) -> Result<(), StoreError> {
    let current = map
        .get(&id)
        .ok_or_else(|| StoreError::not_found("position", id.to_string()))?;
    if current.version != expected_version {
        return Err(StoreError::VersionConflict {
            id,
            expected: expected_version,
            actual: current.version,
        });
    }
    map.remove(&id);
    Ok(())
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.positions.read().await.values().cloned().collect())
    }

    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn insert(&self, position: &Position) -> Result<Position, StoreError> {
        apply_insert(&mut *self.positions.write().await, position)
    }

    async fn update(&self, position: &Position) -> Result<Position, StoreError> {
        apply_update(&mut *self.positions.write().await, position)
    }

    async fn remove(&self, id: PositionId, expected_version: u64) -> Result<(), StoreError> {
        apply_remove(&mut *self.positions.write().await, id, expected_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
