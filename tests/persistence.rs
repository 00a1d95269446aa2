//! Persisted registry and startup recovery.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::MockDriver;
use vmsup::db::StateStore;
use vmsup::vm::VmRecord;
use vmsup::{
    Capacity, CreateRequest, HostHandle, ListFilter, ResourceLedger, RetentionPolicy, Supervisor,
    SupervisorConfig, VmId, VmState,
};

fn config(path: &Path, memory_mb: u64) -> SupervisorConfig {
    SupervisorConfig {
        memory_mb,
        vcpus: 8,
        state_path: path.to_path_buf(),
        monitor_interval: std::time::Duration::ZERO.into(),
        ..SupervisorConfig::default()
    }
}

async fn open(path: &Path, memory_mb: u64, driver: Arc<MockDriver>) -> Supervisor {
    Supervisor::with_driver(config(path, memory_mb), driver)
        .await
        .unwrap()
}

/// Write records as an earlier process would have left them.
fn seed(path: &Path, records: &[VmRecord]) {
    let store = StateStore::open(path).unwrap();
    for (seq, record) in records.iter().enumerate() {
        store.save(seq as u64, record).unwrap();
    }
}

fn record(ledger: &ResourceLedger, name: &str, memory_mb: u32, state: VmState) -> VmRecord {
    let token = ledger.try_reserve(memory_mb, 1).unwrap();
    let mut record = VmRecord::pending(VmId::generate(), name.to_string(), token);
    record.state = state;
    if state.holds_handle() {
        record.host_handle = Some(HostHandle::Session(format!("h-{}", name)));
    }
    record
}

#[tokio::test]
async fn test_running_vm_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");

    let id = {
        let supervisor = open(&path, 1024, MockDriver::new()).await;
        let engine = supervisor.engine();
        let id = engine.admit(&CreateRequest::new(256, 2, "web")).unwrap();
        engine.provision(&id, None).await.unwrap();
        supervisor.shutdown().await;
        id
    };

    let driver = MockDriver::new();
    let supervisor = open(&path, 1024, driver.clone()).await;
    assert_eq!(supervisor.recovery().restored, 1);
    assert_eq!(supervisor.recovery().failed, 0);

    let usage = supervisor.dispatcher().usage();
    assert_eq!(usage.reserved, Capacity::new(256, 2));

    let vm = supervisor.dispatcher().stop(&id, None).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(driver.calls(), ["terminate:session:mock-0".to_string()]);
    assert_eq!(supervisor.dispatcher().usage().reservations, 0);
}

#[tokio::test]
async fn test_interrupted_operations_become_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let ledger = ResourceLedger::new(Capacity::new(4096, 8));

    let pending = record(&ledger, "pending", 128, VmState::Pending);
    let stopping = record(&ledger, "stopping", 128, VmState::Stopping);
    let mut stopped = record(&ledger, "stopped", 128, VmState::Stopped);
    stopped.reservation = None;
    seed(&path, &[pending.clone(), stopping.clone(), stopped.clone()]);

    let driver = MockDriver::new();
    let supervisor = open(&path, 1024, driver.clone()).await;
    assert_eq!(supervisor.recovery().failed, 2);
    assert_eq!(supervisor.recovery().restored, 0);

    let vms = supervisor.dispatcher();
    let by_id = |id: &VmId| vms.list().into_iter().find(|v| &v.id == id).unwrap();
    assert_eq!(by_id(&pending.id).state, VmState::Failed);
    assert_eq!(by_id(&stopping.id).state, VmState::Failed);
    assert!(by_id(&stopping.id).last_error.unwrap().contains("teardown"));
    assert_eq!(by_id(&stopped.id).state, VmState::Stopped);

    // The interrupted teardown was retried once, best-effort.
    assert_eq!(driver.calls(), ["terminate:session:h-stopping".to_string()]);
    assert_eq!(vms.usage().reservations, 0);

    // Records keep their original order.
    let names: Vec<String> = vms.list().into_iter().map(|v| v.name).collect();
    assert_eq!(names, ["pending", "stopping", "stopped"]);
}

#[tokio::test]
async fn test_reservations_that_no_longer_fit_are_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let ledger = ResourceLedger::new(Capacity::new(4096, 8));

    let first = record(&ledger, "first", 200, VmState::Running);
    let second = record(&ledger, "second", 200, VmState::Running);
    seed(&path, &[first.clone(), second.clone()]);

    // Capacity was lowered since these were admitted.
    let driver = MockDriver::new();
    let supervisor = open(&path, 256, driver.clone()).await;
    assert_eq!(supervisor.recovery().restored, 1);
    assert_eq!(supervisor.recovery().failed, 1);

    let failed = supervisor
        .dispatcher()
        .list_filtered(&ListFilter::state(VmState::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, second.id);
    assert_eq!(driver.calls(), ["terminate:session:h-second".to_string()]);

    let usage = supervisor.dispatcher().usage();
    assert_eq!(usage.reserved.memory_mb, 200);

    // New reservations never collide with restored tokens.
    let id = supervisor
        .engine()
        .admit(&CreateRequest::new(56, 1, "fits"))
        .unwrap();
    supervisor.engine().provision(&id, None).await.unwrap();
    assert_eq!(supervisor.dispatcher().usage().reservations, 2);
}

#[tokio::test]
async fn test_retention_evicts_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");

    {
        let mut config = config(&path, 1024);
        config.retention = RetentionPolicy::Discard;
        let supervisor = Supervisor::with_driver(config, MockDriver::new())
            .await
            .unwrap();
        let engine = supervisor.engine();

        for name in ["gone", "kept"] {
            let id = engine.admit(&CreateRequest::new(64, 1, name)).unwrap();
            engine.provision(&id, None).await.unwrap();
            if name == "gone" {
                engine.stop(&id, None).await.unwrap();
                engine.destroy(&id).unwrap();
            }
        }
        assert_eq!(engine.list().len(), 1);
        supervisor.shutdown().await;
    }

    let supervisor = open(&path, 1024, MockDriver::new()).await;
    let names: Vec<String> = supervisor
        .dispatcher()
        .list()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names, ["kept"]);
}

#[tokio::test]
async fn test_in_memory_supervisor() {
    let mut config = SupervisorConfig {
        memory_mb: 512,
        vcpus: 2,
        state_path: Default::default(),
        ..SupervisorConfig::default()
    };
    config.monitor_interval = std::time::Duration::ZERO.into();

    let supervisor = Supervisor::with_driver(config, MockDriver::new())
        .await
        .unwrap();
    assert!(supervisor.dispatcher().list().is_empty());
    assert_eq!(supervisor.recovery(), Default::default());
}
