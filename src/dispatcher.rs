//! Per-VM command serialization.
//!
//! The dispatcher sits in front of the [`LifecycleEngine`] and lets at most
//! one lifecycle operation (provisioning, stop, destroy) run per VM id at a
//! time. Requests for the same id run in arrival order; requests for
//! different ids never wait on each other. Reads go straight to the engine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::engine::{CreateRequest, LifecycleEngine};
use crate::error::Result;
use crate::ledger::LedgerUsage;
use crate::registry::ListFilter;
use crate::vm::{VmId, VmSnapshot};

type LockTable = Arc<Mutex<HashMap<VmId, Slot>>>;

/// A VM's FIFO and the number of callers holding or waiting on it.
#[derive(Debug, Default)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

/// A caller's place in a VM's queue. The table entry goes with the last user.
struct KeyGuard {
    id: VmId,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(&self.id) {
            slot.users -= 1;
            if slot.users == 0 {
                table.remove(&self.id);
            }
        }
    }
}

/// Front door for lifecycle commands.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    engine: LifecycleEngine,
    locks: LockTable,
}

impl CommandDispatcher {
    /// Wrap an engine.
    pub fn new(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    async fn acquire(&self, id: &VmId) -> KeyGuard {
        let lock = {
            let mut table = self.locks.lock();
            let slot = table.entry(id.clone()).or_default();
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        // Counted before waiting so a cancelled waiter still cleans up.
        let mut key = KeyGuard {
            id: id.clone(),
            table: Arc::clone(&self.locks),
            guard: None,
        };
        key.guard = Some(lock.lock_owned().await);
        key
    }

    /// Create a VM.
    ///
    /// Returns once the VM is admitted. Its slot stays held until
    /// provisioning finishes, so a `stop` queued right behind it sees the
    /// settled state.
    pub async fn create(&self, request: CreateRequest) -> Result<VmId> {
        let id = self.engine.admit(&request)?;
        let slot = self.acquire(&id).await;

        let engine = self.engine.clone();
        let task_id = id.clone();
        self.engine.spawn_background(async move {
            let _slot = slot;
            if let Err(e) = engine.provision(&task_id, request.timeout).await {
                tracing::warn!(vm_id = %task_id, error = %e, "provisioning failed");
            }
        });

        Ok(id)
    }

    /// Stop a VM after any earlier command for it has finished.
    pub async fn stop(&self, id: &VmId, timeout: Option<Duration>) -> Result<VmSnapshot> {
        let _slot = self.acquire(id).await;
        self.engine.stop(id, timeout).await
    }

    /// Destroy a VM after any earlier command for it has finished.
    pub async fn destroy(&self, id: &VmId) -> Result<VmSnapshot> {
        let _slot = self.acquire(id).await;
        self.engine.destroy(id)
    }

    /// Snapshot of a VM. Not serialized.
    pub async fn info(&self, id: &VmId) -> Result<VmSnapshot> {
        self.engine.info(id).await
    }

    /// Snapshots of every VM. Not serialized.
    pub fn list(&self) -> Vec<VmSnapshot> {
        self.engine.list()
    }

    /// Snapshots of the VMs matching `filter`. Not serialized.
    pub fn list_filtered(&self, filter: &ListFilter) -> Vec<VmSnapshot> {
        self.engine.list_filtered(filter)
    }

    /// Current capacity usage.
    pub fn usage(&self) -> LedgerUsage {
        self.engine.usage()
    }

    /// Wait until a VM is neither Pending nor Stopping.
    pub async fn wait_until_settled(&self, id: &VmId, timeout: Duration) -> Result<VmSnapshot> {
        self.engine.wait_until_settled(id, timeout).await
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.locks.lock().len()
    }
}
