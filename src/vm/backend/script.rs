//! Manager-script driver.
//!
//! Delegates every operation to an external manager script, optionally run
//! through `sudo -n`:
//!
//! ```text
//! <script> init
//! <script> start <memory_mb> <vcpus> <name>   # prints the VM id on stdout
//! <script> stop <id>
//! <script> info <id>                          # prints a JSON object
//! ```
//!
//! Privilege elevation happens here and nowhere else.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{HostHandle, HypervisorDriver, RuntimeInfo};
use crate::error::DriverError;

/// Driver backed by a manager script.
#[derive(Debug, Clone)]
pub struct ScriptDriver {
    script: PathBuf,
    sudo: bool,
}

impl ScriptDriver {
    /// Create a driver for `script`.
    pub fn new(script: impl AsRef<Path>, sudo: bool) -> Self {
        Self {
            script: script.as_ref().to_path_buf(),
            sudo,
        }
    }

    fn command(&self, args: &[&str]) -> (Command, String) {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.script);
            cmd
        } else {
            Command::new(&self.script)
        };
        cmd.args(args).kill_on_drop(true);

        let mut cmdline = String::new();
        if self.sudo {
            cmdline.push_str("sudo -n ");
        }
        cmdline.push_str(&self.script.display().to_string());
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
        (cmd, cmdline)
    }

    /// Run the script and return its trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, DriverError> {
        let (mut cmd, cmdline) = self.command(args);
        tracing::debug!(command = %cmdline, "running manager script");

        let output = cmd.output().await.map_err(|source| DriverError::Spawn {
            command: cmdline.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command: cmdline,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn session_of(handle: &HostHandle) -> Result<&str, DriverError> {
        match handle {
            HostHandle::Session(id) => Ok(id),
            other => Err(DriverError::UnsupportedHandle(other.to_string())),
        }
    }
}

#[async_trait]
impl HypervisorDriver for ScriptDriver {
    fn name(&self) -> &str {
        "script"
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        self.run(&["init"]).await.map(|_| ())
    }

    async fn provision(
        &self,
        memory_mb: u32,
        vcpus: u32,
        name: &str,
    ) -> Result<HostHandle, DriverError> {
        let memory = memory_mb.to_string();
        let cpus = vcpus.to_string();
        let stdout = self.run(&["start", &memory, &cpus, name]).await?;

        // The id is the last non-empty line; earlier lines are progress output.
        let id = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| DriverError::InvalidOutput("start printed no VM id".into()))?;
        Ok(HostHandle::Session(id.to_string()))
    }

    async fn terminate(&self, handle: &HostHandle) -> Result<(), DriverError> {
        let id = Self::session_of(handle)?;
        self.run(&["stop", id]).await.map(|_| ())
    }

    async fn query(&self, handle: &HostHandle) -> Result<RuntimeInfo, DriverError> {
        let id = Self::session_of(handle)?;
        let stdout = self.run(&["info", id]).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| DriverError::InvalidOutput(format!("info output is not JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable manager script into `dir`.
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vm-manager.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const FAKE_MANAGER: &str = r#"
case "$1" in
  init) exit 0 ;;
  start) echo "booting $4 with $2MiB/$3cpu"; echo "vm-$4" ;;
  stop) [ "$2" = "vm-bad" ] && { echo "no such vm" >&2; exit 3; }; exit 0 ;;
  info) echo "{\"alive\": true, \"pid\": 99, \"ip\": \"10.0.0.5\"}" ;;
  *) exit 64 ;;
esac
"#;

    #[tokio::test]
    async fn test_script_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptDriver::new(write_script(dir.path(), FAKE_MANAGER), false);

        driver.initialize().await.unwrap();

        let handle = driver.provision(128, 1, "web").await.unwrap();
        assert_eq!(handle, HostHandle::Session("vm-web".into()));

        let info = driver.query(&handle).await.unwrap();
        assert!(info.alive);
        assert_eq!(info.pid, Some(99));
        assert_eq!(info.extra["ip"], "10.0.0.5");

        driver.terminate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_script_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptDriver::new(write_script(dir.path(), FAKE_MANAGER), false);

        let err = driver
            .terminate(&HostHandle::Session("vm-bad".into()))
            .await
            .unwrap_err();
        match err {
            DriverError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "no such vm");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_start_output_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ScriptDriver::new(write_script(dir.path(), "exit 0\n"), false);
        let err = driver.provision(64, 1, "x").await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidOutput(_)));
    }

    #[test]
    fn test_sudo_command_line() {
        let driver = ScriptDriver::new("/opt/vm-manager.sh", true);
        let (_, cmdline) = driver.command(&["stop", "vm-1"]);
        assert_eq!(cmdline, "sudo -n /opt/vm-manager.sh stop vm-1");
    }

    #[tokio::test]
    async fn test_missing_script_names_the_command() {
        let driver = ScriptDriver::new("/nonexistent/vm-manager.sh", false);
        match driver.initialize().await.unwrap_err() {
            DriverError::Spawn { command, .. } => {
                assert_eq!(command, "/nonexistent/vm-manager.sh init");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
