//! Supervisor assembly.
//!
//! [`Supervisor`] wires the ledger, registry, driver, engine and dispatcher
//! together from a [`SupervisorConfig`], reconciles persisted records, and
//! owns the health monitor task.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;
use crate::db::StateStore;
use crate::dispatcher::CommandDispatcher;
use crate::engine::{LifecycleEngine, RecoveryReport, Timeouts};
use crate::error::Result;
use crate::ledger::{Capacity, ResourceLedger};
use crate::monitor::HealthMonitor;
use crate::registry::VmRegistry;
use crate::vm::{backend, HypervisorDriver};

/// A running supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    dispatcher: CommandDispatcher,
    recovery: RecoveryReport,
    shutdown_tx: watch::Sender<bool>,
    monitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Build a supervisor with the driver named in `config`.
    pub async fn open(config: SupervisorConfig) -> Result<Self> {
        let driver = backend::create(&config.driver);
        Self::with_driver(config, driver).await
    }

    /// Build a supervisor around an explicit driver.
    ///
    /// Persisted records are loaded and reconciled before this returns.
    pub async fn with_driver(
        config: SupervisorConfig,
        driver: Arc<dyn HypervisorDriver>,
    ) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(ResourceLedger::new(Capacity::new(
            config.memory_mb,
            config.vcpus,
        )));

        let registry = match config.store_path() {
            Some(path) => VmRegistry::open(StateStore::open(path)?, config.retention)?,
            None => VmRegistry::new(config.retention),
        };
        let registry = Arc::new(registry);

        let engine = LifecycleEngine::new(ledger, registry, driver, Timeouts::from(&config));
        let recovery = engine.recover().await?;

        let (shutdown_tx, _) = watch::channel(false);

        tracing::debug!(
            memory_mb = config.memory_mb,
            vcpus = config.vcpus,
            persistent = config.store_path().is_some(),
            "supervisor ready"
        );

        Ok(Self {
            config,
            dispatcher: CommandDispatcher::new(engine),
            recovery,
            shutdown_tx,
            monitor: None,
        })
    }

    /// Command entry point.
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Lifecycle engine behind the dispatcher.
    pub fn engine(&self) -> &LifecycleEngine {
        self.dispatcher.engine()
    }

    /// Active configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// What startup reconciliation did.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Start the health monitor, unless disabled or already running.
    pub fn spawn_monitor(&mut self) {
        if self.monitor.is_some() {
            return;
        }
        let Some(interval) = self.config.monitor_period() else {
            tracing::debug!("health monitor disabled");
            return;
        };

        let monitor = HealthMonitor::new(
            self.dispatcher.clone(),
            interval,
            self.shutdown_tx.subscribe(),
        );
        self.monitor = Some(tokio::spawn(monitor.run()));
    }

    /// Stop the monitor and wait for driver work still in flight.
    ///
    /// Provisioning, teardown and the reaping of timed-out provisions get up
    /// to the provision plus stop timeouts to finish. VMs are left as they
    /// are.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.monitor.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health monitor task failed");
            }
        }

        let limit = self.config.provision_timeout.get() + self.config.stop_timeout.get();
        self.engine().drain_background(limit).await;
        tracing::debug!("supervisor shut down");
    }
}
