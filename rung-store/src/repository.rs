//! Repository trait definitions (Ports)
//!
//! The position store is shared by two uncoordinated writers, so every write
//! is a compare-and-swap on `Position::version`. Writers never overwrite a
//! record they did not read; they go through [`modify_with_retry`], which
//! re-reads and re-applies their mutation when they lose a race.

use async_trait::async_trait;
use tracing::debug;

use rung_domain::{Position, PositionId};

use crate::error::StoreError;

/// Repository for master position records
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// All records, oldest first
    async fn load(&self) -> Result<Vec<Position>, StoreError>;

    /// Find a record by ID
    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    /// Insert a new record. Returns it as stored (version 1).
    ///
    /// Fails with `Duplicate` if the ID is taken.
    async fn insert(&self, position: &Position) -> Result<Position, StoreError>;

    /// Replace a record if `position.version` still matches the stored one.
    ///
    /// Returns the stored record with its version bumped, or
    /// `VersionConflict` if another writer got there first.
    async fn update(&self, position: &Position) -> Result<Position, StoreError>;

    /// Delete a record if its version still matches `expected_version`.
    async fn remove(&self, id: PositionId, expected_version: u64) -> Result<(), StoreError>;
}

/// Outcome of [`modify_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum Modified {
    /// Mutation reported no change; nothing written
    Unchanged(Position),
    /// Written; carries the stored record
    Updated(Position),
    /// Record no longer exists
    Missing,
}

impl Modified {
    /// Stored record after the operation, if it still exists.
    pub fn position(&self) -> Option<&Position> {
        match self {
            Modified::Unchanged(p) | Modified::Updated(p) => Some(p),
            Modified::Missing => None,
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, Modified::Updated(_))
    }
}

/// Read-modify-write with optimistic retry.
///
/// `mutate` is applied to a fresh copy of the record on every attempt and
/// must return `true` if it changed anything material. It may run more than
/// once, so it must describe a change relative to whatever it is given.
///
/// # Errors
/// `ConflictRetriesExhausted` after `max_attempts` lost races; other store
/// errors are returned as they occur.
pub async fn modify_with_retry<S, F>(
    store: &S,
    id: PositionId,
    max_attempts: u32,
    mut mutate: F,
) -> Result<Modified, StoreError>
where
    S: PositionStore + ?Sized,
    F: FnMut(&mut Position) -> bool + Send,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(current) = store.find_by_id(id).await? else {
            return Ok(Modified::Missing);
        };

        let mut next = current.clone();
        if !mutate(&mut next) {
            return Ok(Modified::Unchanged(current));
        }

        match store.update(&next).await {
            Ok(stored) => return Ok(Modified::Updated(stored)),
            Err(e) if e.is_conflict() => {
                debug!(%id, attempt, error = %e, "Version conflict, re-reading");
            },
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::ConflictRetriesExhausted { id, attempts })
}
