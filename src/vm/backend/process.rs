//! Local-process driver.
//!
//! Runs the VM engine (a VMM binary such as a firecracker/cloud-hypervisor
//! wrapper) as a child of the supervisor. The handle is the child's pid.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use super::{HostHandle, HypervisorDriver, RuntimeInfo};
use crate::error::DriverError;
use crate::process;

/// How long a freshly spawned VM process must survive to count as started.
const STARTUP_PROBE: Duration = Duration::from_millis(200);

/// Driver that spawns one host process per VM.
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
    /// Children already reaped by `query`, with their exit codes. Their pids
    /// no longer belong to us and must not be signalled.
    reaped: Arc<Mutex<HashMap<libc::pid_t, i32>>>,
}

impl ProcessDriver {
    /// Create a driver for `program`.
    ///
    /// `args` may contain `{memory_mb}`, `{vcpus}` and `{name}` placeholders.
    pub fn new(program: impl AsRef<Path>, args: Vec<String>, stop_grace: Duration) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args,
            stop_grace,
            reaped: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn command_args(&self, memory_mb: u32, vcpus: u32, name: &str) -> Vec<String> {
        let memory = memory_mb.to_string();
        let cpus = vcpus.to_string();
        self.args
            .iter()
            .map(|arg| {
                crate::util::expand_placeholders(
                    arg,
                    &[("memory_mb", &memory), ("vcpus", &cpus), ("name", name)],
                )
            })
            .collect()
    }

    fn pid_of(handle: &HostHandle) -> Result<libc::pid_t, DriverError> {
        match handle {
            HostHandle::Pid(pid) => Ok(*pid),
            other => Err(DriverError::UnsupportedHandle(other.to_string())),
        }
    }
}

#[async_trait]
impl HypervisorDriver for ProcessDriver {
    fn name(&self) -> &str {
        "process"
    }

    async fn provision(
        &self,
        memory_mb: u32,
        vcpus: u32,
        name: &str,
    ) -> Result<HostHandle, DriverError> {
        let args = self.command_args(memory_mb, vcpus, name);
        let command = self.program.display().to_string();

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: command.clone(),
                source,
            })?;
        let pid = child.id() as libc::pid_t;
        // The std handle is dropped; the process is reaped by waitpid in
        // `process::try_wait` / `process::stop_process`.
        drop(child);

        tokio::time::sleep(STARTUP_PROBE).await;
        if let Some(code) = process::try_wait(pid) {
            return Err(DriverError::CommandFailed {
                command,
                code: Some(code),
                stderr: "VM process exited during startup".into(),
            });
        }

        tracing::debug!(pid = pid, name = %name, "VM process started");
        Ok(HostHandle::Pid(pid))
    }

    async fn terminate(&self, handle: &HostHandle) -> Result<(), DriverError> {
        let pid = Self::pid_of(handle)?;
        if let Some(code) = self.reaped.lock().remove(&pid) {
            tracing::debug!(pid = pid, exit_code = code, "VM process already exited");
            return Ok(());
        }

        let grace = self.stop_grace;
        let code = tokio::task::spawn_blocking(move || process::stop_process(pid, grace))
            .await
            .map_err(|e| DriverError::InvalidOutput(format!("stop task failed: {}", e)))??;
        tracing::debug!(pid = pid, exit_code = code, "VM process stopped");
        Ok(())
    }

    async fn query(&self, handle: &HostHandle) -> Result<RuntimeInfo, DriverError> {
        let pid = Self::pid_of(handle)?;
        let alive = if self.reaped.lock().contains_key(&pid) {
            false
        } else if let Some(code) = process::try_wait(pid) {
            self.reaped.lock().insert(pid, code);
            false
        } else {
            true
        };
        Ok(RuntimeInfo {
            alive,
            pid: Some(pid),
            rss_mb: if alive {
                process::resident_memory_mb(pid)
            } else {
                None
            },
            extra: serde_json::Map::new(),
        })
    }
}
