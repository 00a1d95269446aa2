//! Property-based tests for capacity accounting.
//!
//! Random sequences of create/stop/destroy, with random driver failures,
//! must never over-commit the host and must keep the ledger in step with
//! the states of the recorded VMs.

mod common;

use proptest::prelude::*;
use std::sync::atomic::Ordering;

use common::{engine, MockDriver};
use vmsup::{Capacity, CreateRequest, Error, LifecycleEngine, VmId, VmState};

const HOST: Capacity = Capacity {
    memory_mb: 1024,
    vcpus: 4,
};

#[derive(Debug, Clone)]
enum Op {
    Create {
        memory_mb: u32,
        vcpus: u32,
        fail: bool,
    },
    Stop {
        pick: usize,
        fail: bool,
    },
    Destroy {
        pick: usize,
    },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..600, 1u32..4, prop::bool::weighted(0.2))
            .prop_map(|(memory_mb, vcpus, fail)| Op::Create { memory_mb, vcpus, fail }),
        2 => (any::<usize>(), prop::bool::weighted(0.2))
            .prop_map(|(pick, fail)| Op::Stop { pick, fail }),
        1 => any::<usize>().prop_map(|pick| Op::Destroy { pick }),
    ]
}

/// Reserved totals must equal the sizes of the VMs that hold capacity.
fn check_accounting(engine: &LifecycleEngine) -> Result<(), TestCaseError> {
    let usage = engine.usage();
    let holding: Vec<_> = engine
        .list()
        .into_iter()
        .filter(|vm| vm.state.holds_reservation())
        .collect();

    let memory: u64 = holding.iter().map(|vm| u64::from(vm.memory_mb)).sum();
    let vcpus: u32 = holding.iter().map(|vm| vm.vcpus).sum();

    prop_assert!(usage.reserved.memory_mb <= HOST.memory_mb);
    prop_assert!(usage.reserved.vcpus <= HOST.vcpus);
    prop_assert_eq!(usage.reserved, Capacity::new(memory, vcpus));
    prop_assert_eq!(usage.reservations, holding.len());
    Ok(())
}

fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let driver = MockDriver::new();
        let engine = engine(driver.clone(), HOST.memory_mb, HOST.vcpus);
        let mut ids: Vec<VmId> = Vec::new();

        for op in ops {
            match op {
                Op::Create {
                    memory_mb,
                    vcpus,
                    fail,
                } => {
                    driver.fail_provision.store(fail, Ordering::SeqCst);
                    let before = engine.usage();
                    match engine.admit(&CreateRequest::new(memory_mb, vcpus, "p")) {
                        Ok(id) => {
                            let result = engine.provision(&id, None).await;
                            prop_assert_eq!(result.is_err(), fail);
                            ids.push(id);
                        }
                        Err(Error::InsufficientResources { .. }) => {
                            prop_assert_eq!(engine.usage(), before);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
                    }
                }
                Op::Stop { pick, fail } if !ids.is_empty() => {
                    driver.fail_terminate.store(fail, Ordering::SeqCst);
                    let id = &ids[pick % ids.len()];
                    let was = engine.info(id).await.unwrap().state;
                    let result = engine.stop(id, None).await;
                    match was {
                        VmState::Running => {
                            prop_assert_eq!(result.is_err(), fail);
                            let now = engine.info(id).await.unwrap().state;
                            let expected = if fail { VmState::Failed } else { VmState::Stopped };
                            prop_assert_eq!(now, expected);
                        }
                        _ => {
                            let rejected = matches!(result, Err(Error::InvalidState { .. }));
                            prop_assert!(rejected);
                        }
                    }
                }
                Op::Destroy { pick } if !ids.is_empty() => {
                    let id = &ids[pick % ids.len()];
                    let was = engine.info(id).await.unwrap().state;
                    let result = engine.destroy(id);
                    let allowed = matches!(was, VmState::Stopped | VmState::Failed);
                    prop_assert_eq!(result.is_ok(), allowed);
                }
                Op::Stop { .. } | Op::Destroy { .. } => {}
            }
            check_accounting(&engine)?;
        }

        // Tearing everything down returns the host to empty.
        for id in &ids {
            if engine.info(id).await.unwrap().state == VmState::Running {
                driver.fail_terminate.store(false, Ordering::SeqCst);
                engine.stop(id, None).await.unwrap();
            }
        }
        let usage = engine.usage();
        prop_assert_eq!(usage.reservations, 0);
        prop_assert_eq!(usage.available, HOST);
        Ok::<(), TestCaseError>(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No sequence of operations over-commits the host or leaks a reservation.
    #[test]
    fn prop_ledger_never_overcommits(ops in prop::collection::vec(arb_op(), 1..40)) {
        run_ops(ops)?;
    }
}
