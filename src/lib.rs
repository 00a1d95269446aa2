//! vmsup - VM lifecycle supervisor
//!
//! vmsup admits VM creation requests against a fixed host capacity, drives
//! each VM through a small state machine, and delegates the actual
//! hypervisor work to a pluggable driver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  vmsup CLI / Library                            │
//! ├─────────────────────────────────────────────────┤
//! │  CommandDispatcher (per-VM ordering)            │
//! ├─────────────────────────────────────────────────┤
//! │  LifecycleEngine (state machine)                │
//! ├────────────────┬──────────────┬─────────────────┤
//! │ ResourceLedger │  VmRegistry  │ HypervisorDriver│
//! │                │  (redb)      │ (script/process)│
//! └────────────────┴──────────────┴─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vmsup::{CreateRequest, Supervisor, SupervisorConfig};
//! use std::time::Duration;
//!
//! # async fn demo() -> vmsup::Result<()> {
//! let supervisor = Supervisor::open(SupervisorConfig::load()?).await?;
//! let vms = supervisor.dispatcher();
//!
//! let id = vms.create(CreateRequest::new(256, 1, "web")).await?;
//! let vm = vms.wait_until_settled(&id, Duration::from_secs(120)).await?;
//! println!("{} is {}", vm.id, vm.state);
//!
//! vms.stop(&id, None).await?;
//! vms.destroy(&id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod util;
pub mod vm;

// Re-export main types for convenience
pub use config::SupervisorConfig;
pub use dispatcher::CommandDispatcher;
pub use engine::{CreateRequest, LifecycleEngine, TransitionEvent};
pub use error::{DriverError, Error, Result};
pub use ledger::{Capacity, ResourceLedger};
pub use registry::{ListFilter, RetentionPolicy, VmRegistry};
pub use supervisor::Supervisor;
pub use vm::{HostHandle, HypervisorDriver, RuntimeInfo, VmId, VmSnapshot, VmState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
