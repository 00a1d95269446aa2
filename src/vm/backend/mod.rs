//! Hypervisor driver implementations.
//!
//! The lifecycle engine never talks to a hypervisor directly. It calls a
//! [`HypervisorDriver`], which either shells out to a privileged manager
//! script ([`ScriptDriver`]) or runs the VM engine as a local child process
//! ([`ProcessDriver`]).

mod process;
mod script;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::DriverConfig;
use crate::error::DriverError;

pub use process::ProcessDriver;
pub use script::ScriptDriver;

/// Opaque reference to the OS-level VM instance.
///
/// Produced by [`HypervisorDriver::provision`] and only ever handed back to
/// the same driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum HostHandle {
    /// Local VM process.
    Pid(i32),
    /// Identifier issued by an external manager.
    Session(String),
}

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostHandle::Pid(pid) => write!(f, "pid:{}", pid),
            HostHandle::Session(s) => write!(f, "session:{}", s),
        }
    }
}

/// Live information about a running VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Whether the VM is still up.
    #[serde(default = "default_alive")]
    pub alive: bool,
    /// Host process id, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Resident memory of the VM process in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_mb: Option<u64>,
    /// Anything else the driver reported.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_alive() -> bool {
    true
}

/// Capability interface to the hypervisor.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Prepare the host (networking, images). Idempotent.
    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Start a VM with the given resources.
    async fn provision(
        &self,
        memory_mb: u32,
        vcpus: u32,
        name: &str,
    ) -> Result<HostHandle, DriverError>;

    /// Stop a VM previously returned by [`provision`](Self::provision).
    async fn terminate(&self, handle: &HostHandle) -> Result<(), DriverError>;

    /// Fetch live metrics for a VM.
    async fn query(&self, handle: &HostHandle) -> Result<RuntimeInfo, DriverError>;
}

/// Create the driver described by the configuration.
pub fn create(config: &DriverConfig) -> Arc<dyn HypervisorDriver> {
    let driver: Arc<dyn HypervisorDriver> = match config {
        DriverConfig::Script { script, sudo } => Arc::new(ScriptDriver::new(script, *sudo)),
        DriverConfig::Process {
            program,
            args,
            stop_grace,
        } => Arc::new(ProcessDriver::new(program, args.clone(), stop_grace.get())),
    };
    tracing::debug!(driver = driver.name(), "hypervisor driver created");
    driver
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_info_defaults_and_extra_fields() {
        let info: RuntimeInfo =
            serde_json::from_str(r#"{"pid": 12, "ip": "10.0.0.2"}"#).unwrap();
        assert!(info.alive);
        assert_eq!(info.pid, Some(12));
        assert_eq!(info.rss_mb, None);
        assert_eq!(info.extra["ip"], "10.0.0.2");

        let info: RuntimeInfo = serde_json::from_str(r#"{"alive": false}"#).unwrap();
        assert!(!info.alive);
    }

    #[test]
    fn test_handle_serialization() {
        let json = serde_json::to_string(&HostHandle::Pid(7)).unwrap();
        assert_eq!(json, r#"{"type":"pid","value":7}"#);
        let back: HostHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HostHandle::Pid(7));

        let session = HostHandle::Session("vm42".into());
        assert_eq!(session.to_string(), "session:vm42");
    }
}
