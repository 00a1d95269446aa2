//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vmsup::engine::Timeouts;
use vmsup::{
    Capacity, CommandDispatcher, DriverError, HostHandle, HypervisorDriver, LifecycleEngine,
    ResourceLedger, RetentionPolicy, RuntimeInfo, VmRegistry,
};

/// In-memory driver with scriptable behavior.
#[derive(Default)]
pub struct MockDriver {
    pub provision_delay: Mutex<Duration>,
    pub terminate_delay: Mutex<Duration>,
    pub fail_provision: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub alive: AtomicBool,
    next: AtomicU32,
    /// Every driver call, in order, as "provision:<name>" or "terminate:<handle>".
    pub calls: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self::default();
        driver.alive.store(true, Ordering::SeqCst);
        Arc::new(driver)
    }

    pub fn set_provision_delay(&self, d: Duration) {
        *self.provision_delay.lock() = d;
    }

    pub fn set_terminate_delay(&self, d: Duration) {
        *self.terminate_delay.lock() = d;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn terminations(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("terminate:"))
            .count()
    }
}

#[async_trait]
impl HypervisorDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(
        &self,
        _memory_mb: u32,
        _vcpus: u32,
        name: &str,
    ) -> Result<HostHandle, DriverError> {
        let delay = *self.provision_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(format!("provision:{}", name));
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(DriverError::CommandFailed {
                command: "mock start".into(),
                code: Some(1),
                stderr: "no kvm".into(),
            });
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(HostHandle::Session(format!("mock-{}", n)))
    }

    async fn terminate(&self, handle: &HostHandle) -> Result<(), DriverError> {
        let delay = *self.terminate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(format!("terminate:{}", handle));
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(DriverError::CommandFailed {
                command: "mock stop".into(),
                code: Some(2),
                stderr: "busy".into(),
            });
        }
        Ok(())
    }

    async fn query(&self, _handle: &HostHandle) -> Result<RuntimeInfo, DriverError> {
        Ok(RuntimeInfo {
            alive: self.alive.load(Ordering::SeqCst),
            ..RuntimeInfo::default()
        })
    }
}

/// Short bounds so timeout tests run quickly.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        provision: Duration::from_secs(5),
        stop: Duration::from_secs(5),
        query: Duration::from_secs(1),
    }
}

pub fn engine(driver: Arc<MockDriver>, memory_mb: u64, vcpus: u32) -> LifecycleEngine {
    LifecycleEngine::new(
        Arc::new(ResourceLedger::new(Capacity::new(memory_mb, vcpus))),
        Arc::new(VmRegistry::new(RetentionPolicy::Unbounded)),
        driver,
        fast_timeouts(),
    )
}

pub fn dispatcher(driver: Arc<MockDriver>, memory_mb: u64, vcpus: u32) -> CommandDispatcher {
    CommandDispatcher::new(engine(driver, memory_mb, vcpus))
}

pub const SETTLE: Duration = Duration::from_secs(10);
