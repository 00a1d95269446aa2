//! Health monitor behavior.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{dispatcher, MockDriver, SETTLE};
use tokio::sync::watch;
use vmsup::monitor::HealthMonitor;
use vmsup::{CreateRequest, VmState};

#[tokio::test]
async fn test_dead_vm_is_stopped_and_released() {
    let driver = MockDriver::new();
    let vms = dispatcher(driver.clone(), 512, 2);
    let (_tx, rx) = watch::channel(false);
    let monitor = HealthMonitor::new(vms.clone(), Duration::from_secs(60), rx);

    let a = vms.create(CreateRequest::new(256, 1, "a")).await.unwrap();
    vms.wait_until_settled(&a, SETTLE).await.unwrap();

    // Alive: nothing happens.
    assert_eq!(monitor.check_all().await, 0);
    assert_eq!(vms.info(&a).await.unwrap().state, VmState::Running);

    driver.alive.store(false, Ordering::SeqCst);
    assert_eq!(monitor.check_all().await, 1);

    let vm = vms.info(&a).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vms.usage().reservations, 0);

    // Only Running VMs are queried.
    assert_eq!(monitor.check_all().await, 0);
}

#[tokio::test]
async fn test_monitor_loop_runs_until_shutdown() {
    let driver = MockDriver::new();
    let vms = dispatcher(driver.clone(), 512, 2);
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(HealthMonitor::new(vms.clone(), Duration::from_millis(20), rx).run());

    let a = vms.create(CreateRequest::new(128, 1, "a")).await.unwrap();
    vms.wait_until_settled(&a, SETTLE).await.unwrap();
    driver.alive.store(false, Ordering::SeqCst);

    let deadline = tokio::time::Instant::now() + SETTLE;
    while vms.info(&a).await.unwrap().state == VmState::Running {
        assert!(tokio::time::Instant::now() < deadline, "monitor never stopped the VM");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let vm = vms.wait_until_settled(&a, SETTLE).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor did not shut down")
        .unwrap();
}
