//! Coordinator: shared context for the reconciler, the price monitor and
//! the desk.
//!
//! Holds the adapters, the ladder engine and the runtime switches. Both
//! writers reach the store only through [`Coordinator::modify`] and
//! [`Coordinator::remove_closed`], which retry on version conflicts.
//!
//! Monitor exits are claimed here for the whole span between order placement
//! and their store write. While a claim is held the reconciler leaves the
//! position's quantity to the monitor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use rung_domain::{Position, PositionId};
use rung_engine::{LadderEngine, Thresholds};
use rung_exec::{ExchangePort, HistorySink, MarketDataPort, Notifier};
use rung_store::{modify_with_retry, Modified, PositionStore, StoreError};

use crate::config::Config;
use crate::error::DaemonResult;
use crate::event_bus::EventBus;

/// External collaborators the daemon runs against.
#[derive(Clone)]
pub struct Adapters {
    pub exchange: Arc<dyn ExchangePort>,
    pub market_data: Arc<dyn MarketDataPort>,
    pub store: Arc<dyn PositionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub history: Arc<dyn HistorySink>,
}

type ExitSet = Arc<Mutex<HashSet<PositionId>>>;

fn lock(exits: &ExitSet) -> MutexGuard<'_, HashSet<PositionId>> {
    exits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A monitor exit in flight for one position. Released on drop.
#[must_use]
#[derive(Debug)]
pub struct ExitClaim {
    exits: ExitSet,
    id: PositionId,
}

impl ExitClaim {
    pub fn position_id(&self) -> PositionId {
        self.id
    }
}

impl Drop for ExitClaim {
    fn drop(&mut self) {
        lock(&self.exits).remove(&self.id);
    }
}

/// Shared daemon context.
pub struct Coordinator {
    pub exchange: Arc<dyn ExchangePort>,
    pub market_data: Arc<dyn MarketDataPort>,
    pub store: Arc<dyn PositionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub history: Arc<dyn HistorySink>,
    pub event_bus: Arc<EventBus>,
    /// Cancelled once on shutdown
    pub shutdown: CancellationToken,
    /// In-flight order submissions awaited on shutdown
    pub tasks: TaskTracker,
    ladder: LadderEngine,
    thresholds: Thresholds,
    tpsl_enabled: AtomicBool,
    max_retries: u32,
    debounce: Duration,
    monitor_refresh: Duration,
    default_leverage: u32,
    exits: ExitSet,
}

impl Coordinator {
    /// Build the context from configuration and adapters.
    pub fn new(config: &Config, adapters: Adapters) -> DaemonResult<Self> {
        let ladder = LadderEngine::new(config.ladder.schedule.clone(), config.ladder.limit_offset)?;

        Ok(Self {
            exchange: adapters.exchange,
            market_data: adapters.market_data,
            store: adapters.store,
            notifier: adapters.notifier,
            history: adapters.history,
            event_bus: Arc::new(EventBus::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ladder,
            thresholds: config.reconcile.thresholds.clone(),
            tpsl_enabled: AtomicBool::new(config.reconcile.tpsl_enabled),
            max_retries: config.store.max_retries,
            debounce: Duration::from_millis(config.monitor.debounce_ms),
            monitor_refresh: Duration::from_secs(config.monitor.refresh_secs),
            default_leverage: config.exchange.default_leverage,
            exits: ExitSet::default(),
        })
    }

    pub fn ladder(&self) -> &LadderEngine {
        &self.ladder
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Minimum gap between two triggers on one position.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Fallback period for the monitor's cache reload.
    pub fn monitor_refresh(&self) -> Duration {
        self.monitor_refresh
    }

    pub fn default_leverage(&self) -> u32 {
        self.default_leverage
    }

    /// Whether ladder and stop orders are being managed.
    pub fn tpsl_enabled(&self) -> bool {
        self.tpsl_enabled.load(Ordering::SeqCst)
    }

    /// Turn ladder and stop management on or off. Returns the previous value.
    pub fn set_tpsl_enabled(&self, enabled: bool) -> bool {
        let previous = self.tpsl_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "TP/SL management switched");
        }
        previous
    }

    /// Claim the exit of `id`, or `None` if one is already in flight.
    pub fn claim_exit(&self, id: PositionId) -> Option<ExitClaim> {
        lock(&self.exits).insert(id).then(|| ExitClaim {
            exits: self.exits.clone(),
            id,
        })
    }

    /// Whether a monitor exit for `id` is between order and store write.
    pub fn exit_in_flight(&self, id: PositionId) -> bool {
        lock(&self.exits).contains(&id)
    }

    /// Read-modify-write one record with optimistic retry.
    pub async fn modify<F>(&self, id: PositionId, mutate: F) -> DaemonResult<Modified>
    where
        F: FnMut(&mut Position) -> bool + Send,
    {
        Ok(modify_with_retry(self.store.as_ref(), id, self.max_retries, mutate).await?)
    }

    /// Delete a closed record.
    ///
    /// Returns `false` if it is already gone or is no longer closed.
    pub async fn remove_closed(&self, id: PositionId) -> DaemonResult<bool> {
        let attempts = self.max_retries.max(1);
        for attempt in 1..=attempts {
            let Some(current) = self.store.find_by_id(id).await? else {
                return Ok(false);
            };
            if !current.is_closed() {
                return Ok(false);
            }
            match self.store.remove(id, current.version).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(%id, attempt, "Version conflict on removal, re-reading");
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::ConflictRetriesExhausted { id, attempts }.into())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rung_domain::{Price, Side, Symbol};
    use rung_exec::{LogNotifier, MemoryHistory, StubExchange, StubMarketData};
    use rung_store::MemoryStore;
    use rust_decimal_macros::dec;

    fn coordinator(store: Arc<MemoryStore>) -> Coordinator {
        let adapters = Adapters {
            exchange: Arc::new(StubExchange::new()),
            market_data: Arc::new(StubMarketData::new()),
            store,
            notifier: Arc::new(LogNotifier),
            history: Arc::new(MemoryHistory::new()),
        };
        Coordinator::new(&Config::test(), adapters).unwrap()
    }

    fn position() -> Position {
        Position::new(
            Symbol::from_pair("BTCUSDT").unwrap(),
            Side::Long,
            vec![Price::new(dec!(100)).unwrap()],
            Some(Price::new(dec!(90)).unwrap()),
            dec!(1),
        )
    }

    #[test]
    fn test_exit_claim_is_exclusive_until_dropped() {
        let ctx = coordinator(Arc::new(MemoryStore::new()));
        let id = uuid::Uuid::now_v7();

        let claim = ctx.claim_exit(id).unwrap();
        assert_eq!(claim.position_id(), id);
        assert!(ctx.exit_in_flight(id));
        assert!(ctx.claim_exit(id).is_none());

        drop(claim);
        assert!(!ctx.exit_in_flight(id));
        assert!(ctx.claim_exit(id).is_some());
    }

    #[test]
    fn test_tpsl_switch() {
        let ctx = coordinator(Arc::new(MemoryStore::new()));
        assert!(ctx.tpsl_enabled());
        assert!(ctx.set_tpsl_enabled(false));
        assert!(!ctx.tpsl_enabled());
    }

    #[tokio::test]
    async fn test_remove_closed_only_removes_closed_records() {
        let store = Arc::new(MemoryStore::new());
        let ctx = coordinator(store.clone());
        let stored = store.insert(&position()).await.unwrap();

        assert!(!ctx.remove_closed(stored.id).await.unwrap());

        ctx.modify(stored.id, |p| {
            p.mark_closed(chrono::Utc::now());
            true
        })
        .await
        .unwrap();

        assert!(ctx.remove_closed(stored.id).await.unwrap());
        assert!(!ctx.remove_closed(stored.id).await.unwrap());
        assert_eq!(store.position_count().await, 0);
    }
}
