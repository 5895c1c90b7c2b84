//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Reconciler (periodic exchange sync and ladder submission)
//! - Price Monitor (streaming exit triggers)
//! - Desk (manual operations)
//! - Event Bus (internal communication)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Build adapters (stubs in test, Bitunix otherwise)
//! 3. Start the reconciler and the price monitor
//! 4. Wait for SIGINT or a cancelled shutdown token
//! 5. Stop both loops and let in-flight submissions finish

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rung_connectors::{BitunixRestClient, BitunixTickerFeed, JoinNotifier};
use rung_exec::{LogNotifier, MemoryHistory, StubExchange, StubMarketData};
use rung_store::{JsonFileStore, JsonlHistory, MemoryStore};

use crate::config::{Config, Environment};
use crate::coordinator::{Adapters, Coordinator};
use crate::desk::Desk;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::DaemonEvent;
use crate::price_monitor::PriceMonitor;
use crate::reconciler::Reconciler;

// =============================================================================
// Daemon
// =============================================================================

/// The main Rung daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Shared context
    ctx: Arc<Coordinator>,
}

impl Daemon {
    /// Create a daemon over the given adapters.
    pub fn new(config: Config, adapters: Adapters) -> DaemonResult<Self> {
        let ctx = Arc::new(Coordinator::new(&config, adapters)?);
        Ok(Self { config, ctx })
    }

    /// Create a daemon with stub components (for testing/development).
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        let adapters = Adapters {
            exchange: Arc::new(StubExchange::new()),
            market_data: Arc::new(StubMarketData::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(LogNotifier),
            history: Arc::new(MemoryHistory::new()),
        };
        Self::new(config, adapters)
    }

    /// Create a daemon for the configured environment.
    ///
    /// The test environment runs on stubs; every other environment talks to
    /// Bitunix and persists to the configured files.
    pub async fn from_config(config: Config) -> DaemonResult<Self> {
        if config.environment == Environment::Test {
            return Self::new_stub(config);
        }

        let (Some(api_key), Some(api_secret)) =
            (config.exchange.api_key.clone(), config.exchange.api_secret.clone())
        else {
            return Err(DaemonError::Config("Bitunix credentials are not set".to_string()));
        };

        let store = JsonFileStore::open(&config.store.path).await?;
        let notifier = JoinNotifier::new(config.notify.join_api_key.clone(), config.notify.join_device_id.clone());
        if !notifier.is_enabled() {
            warn!("JOIN_API_KEY not set, notifications only go to the log");
        }

        let adapters = Adapters {
            exchange: Arc::new(BitunixRestClient::new(api_key, api_secret)),
            market_data: Arc::new(BitunixTickerFeed::spawn()),
            store: Arc::new(store),
            notifier: Arc::new(notifier),
            history: Arc::new(JsonlHistory::new(config.store.history_path.clone())),
        };
        Self::new(config, adapters)
    }

    /// Shared context (adapters, event bus, switches).
    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.ctx.clone()
    }

    /// Manual operations bound to this daemon.
    pub fn desk(&self) -> Desk {
        Desk::new(self.ctx.clone())
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until SIGINT or until the shutdown token is
    /// cancelled.
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            interval_secs = self.config.reconcile.interval_secs,
            tpsl_enabled = self.ctx.tpsl_enabled(),
            "Starting Rung daemon"
        );

        let tracked = self.ctx.store.load().await?.len();
        info!(tracked, "Loaded tracked positions");

        let reconciler = Arc::new(Reconciler::new(self.ctx.clone()));
        let interval = Duration::from_secs(self.config.reconcile.interval_secs);
        let reconcile_task = tokio::spawn(reconciler.run(interval, self.ctx.shutdown.clone()));
        let monitor_task = tokio::spawn(PriceMonitor::new(self.ctx.clone()).run());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = self.ctx.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.shutdown(reconcile_task, monitor_task).await;
        Ok(())
    }

    /// Graceful shutdown: stop both loops, then wait for dispatched closes.
    async fn shutdown(&self, reconcile_task: JoinHandle<()>, monitor_task: JoinHandle<()>) {
        info!("Initiating graceful shutdown");

        self.ctx.event_bus.send(DaemonEvent::Shutdown);
        self.ctx.shutdown.cancel();

        for (name, task) in [("reconciler", reconcile_task), ("price monitor", monitor_task)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        self.ctx.tasks.close();
        if !self.ctx.tasks.is_empty() {
            info!(in_flight = self.ctx.tasks.len(), "Waiting for in-flight submissions");
        }
        self.ctx.tasks.wait().await;

        info!("Shutdown complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
