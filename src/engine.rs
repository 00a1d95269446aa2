//! VM lifecycle engine.
//!
//! The engine owns the state machine. It is the only code that reserves or
//! releases capacity, calls the hypervisor driver, or moves a record between
//! states:
//!
//! ```text
//! Pending  --provision ok-->   Running
//! Pending  --provision err-->  Failed
//! Running  --stop-->           Stopping
//! Stopping --terminate ok-->   Stopped
//! Stopping --terminate err-->  Failed
//! Stopped | Failed --destroy-> Destroyed
//! ```
//!
//! Every transition is a compare-and-set on the registry: the closure checks
//! the current state under the registry lock, so two racing callers can never
//! both win. A reservation is taken out of the record in the same step that
//! leaves the reserving states, which makes a second release impossible.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::ledger::{LedgerUsage, ReservationToken, ResourceLedger};
use crate::registry::{ListFilter, VmRegistry};
use crate::vm::{HostHandle, HypervisorDriver, RuntimeInfo, VmId, VmRecord, VmSnapshot, VmState};

/// Capacity of the transition event channel.
const EVENT_CAPACITY: usize = 256;

const ALL_STATES: [VmState; 6] = [
    VmState::Pending,
    VmState::Running,
    VmState::Stopping,
    VmState::Stopped,
    VmState::Failed,
    VmState::Destroyed,
];

/// Default bounds on driver calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on `provision`.
    pub provision: Duration,
    /// Bound on `terminate`.
    pub stop: Duration,
    /// Bound on `query`.
    pub query: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for Timeouts {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            provision: config.provision_timeout.get(),
            stop: config.stop_timeout.get(),
            query: config.query_timeout.get(),
        }
    }
}

/// Parameters for a new VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Memory in MiB. Must be positive.
    pub memory_mb: u32,
    /// vCPU count. Must be at least 1.
    pub vcpus: u32,
    /// Free-form label; not required to be unique.
    pub name: String,
    /// Provisioning bound; the configured default when `None`.
    pub timeout: Option<Duration>,
}

impl CreateRequest {
    /// Request with the default provisioning timeout.
    pub fn new(memory_mb: u32, vcpus: u32, name: impl Into<String>) -> Self {
        Self {
            memory_mb,
            vcpus,
            name: name.into(),
            timeout: None,
        }
    }

    /// Override the provisioning timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(Error::InvalidArgument(
                "memory_mb must be greater than 0".into(),
            ));
        }
        if self.vcpus == 0 {
            return Err(Error::InvalidArgument("vcpus must be at least 1".into()));
        }
        Ok(())
    }
}

/// A state change, published to [`LifecycleEngine::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    /// VM that changed.
    pub id: VmId,
    /// Previous state; `None` when the record was created.
    pub from: Option<VmState>,
    /// New state.
    pub to: VmState,
    /// When the change was recorded.
    pub at: DateTime<Utc>,
}

/// Outcome of [`LifecycleEngine::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running VMs whose reservation was re-committed.
    pub restored: usize,
    /// Records moved to Failed because their operation was interrupted or
    /// their reservation no longer fits.
    pub failed: usize,
}

/// Drives VMs through their lifecycle.
///
/// Cheap to clone; clones share the same ledger, registry and driver.
#[derive(Clone)]
pub struct LifecycleEngine {
    ledger: Arc<ResourceLedger>,
    registry: Arc<VmRegistry>,
    driver: Arc<dyn HypervisorDriver>,
    timeouts: Timeouts,
    events: broadcast::Sender<TransitionEvent>,
    /// Provisioning, teardown and reaper tasks that may outlive their caller.
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("driver", &self.driver.name())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl LifecycleEngine {
    /// Create an engine over the given components.
    pub fn new(
        ledger: Arc<ResourceLedger>,
        registry: Arc<VmRegistry>,
        driver: Arc<dyn HypervisorDriver>,
        timeouts: Timeouts,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ledger,
            registry,
            driver,
            timeouts,
            events,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Prepare the host through the driver.
    pub async fn initialize(&self) -> Result<()> {
        tracing::info!(driver = self.driver.name(), "initializing host");
        self.driver.initialize().await.map_err(Error::Host)
    }

    /// Create a VM.
    ///
    /// Capacity is reserved and a Pending record inserted before this
    /// returns; provisioning continues on a spawned task. Use
    /// [`wait_until_settled`](Self::wait_until_settled) to observe the
    /// outcome. Must be called from within a Tokio runtime.
    pub fn create(&self, request: CreateRequest) -> Result<VmId> {
        let id = self.admit(&request)?;

        let engine = self.clone();
        let task_id = id.clone();
        self.spawn_background(async move {
            if let Err(e) = engine.provision(&task_id, request.timeout).await {
                tracing::warn!(vm_id = %task_id, error = %e, "provisioning failed");
            }
        });

        Ok(id)
    }

    /// Validate a request, reserve its capacity and insert a Pending record.
    ///
    /// On any failure nothing stays reserved and no record exists.
    pub fn admit(&self, request: &CreateRequest) -> Result<VmId> {
        request.validate()?;

        let token = self
            .ledger
            .try_reserve(request.memory_mb, request.vcpus)
            .map_err(|denied| {
                tracing::info!(name = %request.name, %denied, "create rejected");
                Error::InsufficientResources {
                    name: request.name.clone(),
                    denied,
                }
            })?;

        let id = VmId::generate();
        let record = VmRecord::pending(id.clone(), request.name.clone(), token);
        if let Err(e) = self.registry.insert(record) {
            self.release(&id, token)?;
            return Err(e);
        }

        tracing::info!(
            vm_id = %id,
            name = %request.name,
            memory_mb = request.memory_mb,
            vcpus = request.vcpus,
            "VM admitted"
        );
        self.emit(&id, None, VmState::Pending);
        Ok(id)
    }

    /// Provision a Pending VM and record the outcome.
    ///
    /// The driver call runs on its own task. If it outlives `timeout` the VM
    /// is failed at once and the call is left to finish; any handle it
    /// produces afterwards is terminated.
    pub async fn provision(&self, id: &VmId, timeout: Option<Duration>) -> Result<()> {
        let record = self.registry.get(id)?;
        if record.state != VmState::Pending {
            return Err(Error::invalid_state(id, "pending", record.state));
        }

        let limit = timeout.unwrap_or(self.timeouts.provision);
        let driver = Arc::clone(&self.driver);
        let (memory_mb, vcpus, name) = (record.memory_mb, record.vcpus, record.name.clone());
        let mut call =
            tokio::spawn(async move { driver.provision(memory_mb, vcpus, &name).await });

        tracing::debug!(vm_id = %id, driver = self.driver.name(), "provisioning VM");

        match tokio::time::timeout(limit, &mut call).await {
            Ok(Ok(Ok(handle))) => self.mark_running(id, handle).await,
            Ok(Ok(Err(source))) => Err(self.fail(id, Error::driver(id, source))?),
            Ok(Err(join)) => Err(self.fail(
                id,
                Error::InternalFault(format!("provision task for {} failed: {}", id, join)),
            )?),
            Err(_) => {
                self.reap_late_provision(id.clone(), call);
                Err(self.fail(
                    id,
                    Error::Timeout {
                        id: id.clone(),
                        operation: "provision",
                        after: limit,
                    },
                )?)
            }
        }
    }

    /// Stop a Running VM.
    ///
    /// Only the first caller to observe Running wins; later callers get
    /// `InvalidState`. A failed or timed-out teardown still moves the VM to
    /// Failed and releases its reservation before the error is returned.
    ///
    /// Once the VM is Stopping, the teardown runs on its own task and
    /// finishes even if this future is dropped.
    pub async fn stop(&self, id: &VmId, timeout: Option<Duration>) -> Result<VmSnapshot> {
        let (handle, _) = self.transition(id, VmState::Stopping, |r| Ok(r.host_handle.clone()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let engine = self.clone();
        let task_id = id.clone();
        self.spawn_background(async move {
            let _ = done_tx.send(engine.teardown(&task_id, handle, timeout).await);
        });

        done_rx.await.map_err(|_| {
            Error::InternalFault(format!("teardown task for {} ended without a result", id))
        })?
    }

    async fn teardown(
        &self,
        id: &VmId,
        handle: Option<HostHandle>,
        timeout: Option<Duration>,
    ) -> Result<VmSnapshot> {
        let Some(handle) = handle else {
            let err = Error::InternalFault(format!("running VM {} has no host handle", id));
            tracing::error!(vm_id = %id, "running VM has no host handle");
            return Err(self.fail(id, err)?);
        };

        let limit = timeout.unwrap_or(self.timeouts.stop);
        let driver = Arc::clone(&self.driver);
        let call_handle = handle.clone();
        let mut call = tokio::spawn(async move { driver.terminate(&call_handle).await });

        tracing::debug!(vm_id = %id, handle = %handle, "terminating VM");

        let outcome = match tokio::time::timeout(limit, &mut call).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(source))) => Err(Error::driver(id, source)),
            Ok(Err(join)) => Err(Error::InternalFault(format!(
                "terminate task for {} failed: {}",
                id, join
            ))),
            Err(_) => {
                let late_id = id.clone();
                self.spawn_background(async move {
                    match call.await {
                        Ok(Ok(())) => tracing::info!(vm_id = %late_id, "late terminate completed"),
                        Ok(Err(e)) => tracing::warn!(vm_id = %late_id, error = %e, "late terminate failed"),
                        Err(e) => tracing::warn!(vm_id = %late_id, error = %e, "late terminate task failed"),
                    }
                });
                Err(Error::Timeout {
                    id: id.clone(),
                    operation: "terminate",
                    after: limit,
                })
            }
        };

        match outcome {
            Ok(()) => {
                let record = self.settle(id, VmState::Stopped, None)?;
                Ok(record.snapshot())
            }
            Err(e) => Err(self.fail(id, e)?),
        }
    }

    /// Destroy a Stopped or Failed VM.
    ///
    /// The record becomes a tombstone, which the retention policy may then
    /// evict. There is no implicit stop: Running VMs are rejected.
    pub fn destroy(&self, id: &VmId) -> Result<VmSnapshot> {
        let record = self.settle(id, VmState::Destroyed, None)?;

        match self.registry.apply_retention() {
            Ok(evicted) if !evicted.is_empty() => {
                tracing::debug!(count = evicted.len(), "tombstones evicted");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to apply retention"),
        }

        Ok(record.snapshot())
    }

    /// Snapshot of a VM, with live driver data for Running VMs.
    ///
    /// The live query is best-effort: if it fails or times out the snapshot
    /// is returned without `runtime`.
    pub async fn info(&self, id: &VmId) -> Result<VmSnapshot> {
        let record = self.registry.get(id)?;
        let mut snapshot = record.snapshot();

        if let (VmState::Running, Some(handle)) = (record.state, &record.host_handle) {
            match self.query(id, handle).await {
                Ok(runtime) => snapshot.runtime = Some(runtime),
                Err(e) => tracing::debug!(vm_id = %id, error = %e, "runtime query failed"),
            }
        }

        Ok(snapshot)
    }

    /// Query the driver for a handle, bounded by the query timeout.
    pub(crate) async fn query(&self, id: &VmId, handle: &HostHandle) -> Result<RuntimeInfo> {
        let limit = self.timeouts.query;
        match tokio::time::timeout(limit, self.driver.query(handle)).await {
            Ok(result) => result.map_err(|source| Error::driver(id, source)),
            Err(_) => Err(Error::Timeout {
                id: id.clone(),
                operation: "query",
                after: limit,
            }),
        }
    }

    /// Snapshots of every known VM, tombstones included, in creation order.
    pub fn list(&self) -> Vec<VmSnapshot> {
        self.list_filtered(&ListFilter::default())
    }

    /// Snapshots of the VMs matching `filter`, in creation order.
    pub fn list_filtered(&self, filter: &ListFilter) -> Vec<VmSnapshot> {
        self.registry
            .list(filter)
            .iter()
            .map(VmRecord::snapshot)
            .collect()
    }

    /// Current capacity usage.
    pub fn usage(&self) -> LedgerUsage {
        self.ledger.usage()
    }

    /// Wait for provisioning, teardown and reaper tasks still in flight.
    ///
    /// Gives up at `limit` and returns how many tasks were still running.
    /// Tasks spawned while waiting are waited for too.
    pub async fn drain_background(&self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let tasks = std::mem::take(&mut *self.background.lock());
            if tasks.is_empty() {
                return 0;
            }
            tracing::debug!(count = tasks.len(), "waiting for background tasks");

            let mut left = 0;
            for task in tasks {
                match tokio::time::timeout_at(deadline, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "background task failed"),
                    Err(_) => left += 1,
                }
            }
            if left > 0 {
                tracing::warn!(count = left, "background tasks still running");
                return left;
            }
        }
    }

    /// Spawn a task that [`drain_background`](Self::drain_background) will wait for.
    pub(crate) fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.background.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Wait until a VM is neither Pending nor Stopping.
    pub async fn wait_until_settled(&self, id: &VmId, timeout: Duration) -> Result<VmSnapshot> {
        // Subscribe before looking so a transition in between is not missed.
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let record = self.registry.get(id)?;
            if !record.state.is_transient() {
                return Ok(record.snapshot());
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::InternalFault("transition channel closed".into()))
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        id: id.clone(),
                        operation: "settle",
                        after: timeout,
                    })
                }
            }
        }
    }

    /// Reconcile records loaded from disk with the ledger.
    ///
    /// - Running records re-commit their reservation.
    /// - Pending records were interrupted mid-provision and become Failed.
    /// - Stopping records are terminated best-effort and become Failed.
    /// - Records whose reservation no longer fits become Failed.
    ///
    /// Terminal records are left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.registry.list(&ListFilter::default()) {
            let id = &record.id;
            match record.state {
                VmState::Running => {
                    let restored = match record.reservation {
                        Some(token) => self
                            .ledger
                            .restore(token)
                            .map_err(|e| format!("reservation not restored: {}", e)),
                        None => Err("record holds no reservation".to_string()),
                    };
                    match restored {
                        Ok(()) => {
                            tracing::debug!(vm_id = %id, "reservation restored");
                            report.restored += 1;
                        }
                        Err(reason) => {
                            tracing::warn!(vm_id = %id, %reason, "cannot resume running VM");
                            self.recover_failed(&record, reason).await?;
                            report.failed += 1;
                        }
                    }
                }
                VmState::Pending => {
                    tracing::warn!(vm_id = %id, "provisioning was interrupted");
                    self.recover_failed(&record, "interrupted during provisioning".into())
                        .await?;
                    report.failed += 1;
                }
                VmState::Stopping => {
                    tracing::warn!(vm_id = %id, "teardown was interrupted");
                    self.recover_failed(&record, "interrupted during teardown".into())
                        .await?;
                    report.failed += 1;
                }
                VmState::Stopped | VmState::Failed | VmState::Destroyed => {}
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                restored = report.restored,
                failed = report.failed,
                "recovered persisted VMs"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Compare-and-set a record into `next`.
    ///
    /// `f` runs under the registry lock after the edge has been checked; if
    /// it fails, nothing changes.
    fn transition<T, F>(&self, id: &VmId, next: VmState, f: F) -> Result<(T, VmRecord)>
    where
        F: FnOnce(&mut VmRecord) -> Result<T>,
    {
        let (from, value, record) = self.registry.update(id, |r| {
            let from = check_edge(id, r, next)?;
            let value = f(r)?;
            r.set_state(next);
            Ok((from, value, r.clone()))
        })?;

        self.emit(id, Some(from), next);
        Ok((value, record))
    }

    /// Move into a state that holds no resources, releasing what the record
    /// held.
    ///
    /// If the change cannot be saved it is still applied and the reservation
    /// released; the storage error is returned afterwards.
    fn settle(&self, id: &VmId, next: VmState, error: Option<&Error>) -> Result<VmRecord> {
        let ((from, token, record), unsaved) = self.registry.force_update(id, |r| {
            let from = check_edge(id, r, next)?;
            r.host_handle = None;
            if let Some(e) = error {
                r.last_error = Some(e.to_string());
            }
            let token = r.reservation.take();
            r.set_state(next);
            Ok((from, token, r.clone()))
        })?;

        self.emit(id, Some(from), next);
        if let Some(token) = token {
            self.release(id, token)?;
        }
        if let Some(e) = unsaved {
            tracing::error!(vm_id = %id, state = %next, error = %e, "state change not persisted");
            return Err(e);
        }
        Ok(record)
    }

    /// Record `err` by moving the VM to Failed, then hand it back.
    ///
    /// The outer `Result` carries a failure of the transition itself.
    fn fail(&self, id: &VmId, err: Error) -> Result<Error> {
        tracing::warn!(vm_id = %id, error = %err, "VM failed");
        self.settle(id, VmState::Failed, Some(&err))?;
        Ok(err)
    }

    async fn mark_running(&self, id: &VmId, handle: HostHandle) -> Result<()> {
        let stored = handle.clone();
        match self.transition(id, VmState::Running, move |r| {
            r.host_handle = Some(stored);
            Ok(())
        }) {
            Ok(_) => {
                tracing::info!(vm_id = %id, handle = %handle, "VM running");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(vm_id = %id, error = %e, "discarding provisioned instance");
                self.terminate_quietly(id, &handle).await;
                match e {
                    // Still Pending: fail it so the reservation goes back.
                    Error::Storage(_) => Err(self.fail(id, e)?),
                    // The record moved on while the driver was working.
                    e => Err(e),
                }
            }
        }
    }

    /// Terminate whatever a timed-out provision call eventually returns.
    fn reap_late_provision(
        &self,
        id: VmId,
        call: tokio::task::JoinHandle<std::result::Result<HostHandle, crate::error::DriverError>>,
    ) {
        let engine = self.clone();
        self.spawn_background(async move {
            match call.await {
                Ok(Ok(handle)) => {
                    tracing::info!(vm_id = %id, handle = %handle, "reaping late instance");
                    engine.terminate_quietly(&id, &handle).await;
                }
                Ok(Err(e)) => tracing::debug!(vm_id = %id, error = %e, "late provision failed"),
                Err(e) => tracing::warn!(vm_id = %id, error = %e, "late provision task failed"),
            }
        });
    }

    /// Best-effort terminate, bounded by the stop timeout. Failures are logged.
    async fn terminate_quietly(&self, id: &VmId, handle: &HostHandle) {
        match tokio::time::timeout(self.timeouts.stop, self.driver.terminate(handle)).await {
            Ok(Ok(())) => tracing::debug!(vm_id = %id, handle = %handle, "instance terminated"),
            Ok(Err(e)) => {
                tracing::warn!(vm_id = %id, handle = %handle, error = %e, "terminate failed")
            }
            Err(_) => tracing::warn!(vm_id = %id, handle = %handle, "terminate timed out"),
        }
    }

    /// Fail a record during recovery.
    ///
    /// Recovery may fail a Running record, which is not an edge of the normal
    /// state graph, so this bypasses the edge check. The reservation was never
    /// re-committed and is dropped rather than released.
    async fn recover_failed(&self, record: &VmRecord, reason: String) -> Result<()> {
        if let Some(handle) = &record.host_handle {
            self.terminate_quietly(&record.id, handle).await;
        }

        let from = self.registry.update(&record.id, |r| {
            let from = r.state;
            r.host_handle = None;
            r.reservation = None;
            r.last_error = Some(reason);
            r.set_state(VmState::Failed);
            Ok(from)
        })?;
        self.emit(&record.id, Some(from), VmState::Failed);
        Ok(())
    }

    fn release(&self, id: &VmId, token: ReservationToken) -> Result<()> {
        self.ledger.release(token).map_err(|fault| {
            tracing::error!(vm_id = %id, error = %fault, "ledger fault");
            Error::InternalFault(format!("{}: {}", id, fault))
        })
    }

    fn emit(&self, id: &VmId, from: Option<VmState>, to: VmState) {
        tracing::debug!(vm_id = %id, from = ?from, to = %to, "state transition");
        // No receivers is fine.
        let _ = self.events.send(TransitionEvent {
            id: id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// Check that `record` may move to `next`; returns its current state.
fn check_edge(id: &VmId, record: &VmRecord, next: VmState) -> Result<VmState> {
    if !record.state.can_transition_to(next) {
        return Err(Error::invalid_state(id, sources_of(next), record.state));
    }
    Ok(record.state)
}

/// States from which `next` can be reached, for error messages.
fn sources_of(next: VmState) -> String {
    let names: Vec<String> = ALL_STATES
        .iter()
        .filter(|s| s.can_transition_to(next))
        .map(|s| s.to_string())
        .collect();
    names.join(" or ")
}
