//! Health monitor for running VMs.
//!
//! The monitor runs as a background task that periodically queries every
//! Running VM. A VM whose driver reports it is no longer alive is stopped
//! through the dispatcher like any other stop, so its reservation is
//! released and queued commands for it keep their order.

use std::time::Duration;
use tokio::sync::watch;

use crate::dispatcher::CommandDispatcher;
use crate::registry::ListFilter;
use crate::vm::{VmSnapshot, VmState};

/// Background health checker.
pub struct HealthMonitor {
    dispatcher: CommandDispatcher,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    /// Create a monitor that checks every `interval`.
    pub fn new(
        dispatcher: CommandDispatcher,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher,
            interval,
            shutdown_rx,
        }
    }

    /// Run the monitor loop until shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        // Don't catch up on missed ticks
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Check every Running VM once. Returns how many were stopped.
    pub async fn check_all(&self) -> usize {
        let running = self
            .dispatcher
            .list_filtered(&ListFilter::state(VmState::Running));

        let mut stopped = 0;
        for vm in running {
            if self.check(&vm).await {
                stopped += 1;
            }
        }
        stopped
    }

    async fn check(&self, vm: &VmSnapshot) -> bool {
        let runtime = match self.dispatcher.info(&vm.id).await {
            Ok(snapshot) => snapshot.runtime,
            Err(e) => {
                tracing::debug!(vm_id = %vm.id, error = %e, "health check skipped");
                return false;
            }
        };

        // No runtime means the query failed; that is not evidence of death.
        match runtime {
            Some(info) if !info.alive => {}
            _ => return false,
        }

        tracing::warn!(vm_id = %vm.id, name = %vm.name, "VM is no longer alive, stopping");
        match self.dispatcher.stop(&vm.id, None).await {
            Ok(snapshot) => {
                tracing::info!(vm_id = %vm.id, state = %snapshot.state, "dead VM stopped");
                true
            }
            Err(e) => {
                // Another caller may have stopped it first.
                tracing::warn!(vm_id = %vm.id, error = %e, "failed to stop dead VM");
                false
            }
        }
    }
}
