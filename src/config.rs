//! Supervisor configuration.
//!
//! Configuration is read from a TOML file at `$VMSUP_CONFIG`, or
//! `<config dir>/vmsup/config.toml` when the variable is unset. A missing
//! file yields the defaults.
//!
//! ```toml
//! memory_mb = 8192
//! vcpus = 4
//! state_path = "/var/lib/vmsup/state.redb"
//! retention = { keep = 100 }
//! provision_timeout = "2m"
//! stop_timeout = "30s"
//!
//! [driver]
//! kind = "script"
//! script = "/usr/local/sbin/vm-manager.sh"
//! sudo = true
//! ```

use crate::error::{Error, Result};
use crate::registry::RetentionPolicy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and state paths.
const APP_NAME: &str = "vmsup";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "VMSUP_CONFIG";

/// A duration written in humantime form ("30s", "2m", "1h 30m").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(Duration);

impl HumanDuration {
    /// Wrap a duration.
    pub const fn new(d: Duration) -> Self {
        Self(d)
    }

    /// The wrapped duration.
    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Which hypervisor driver to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Delegate to a manager script.
    Script {
        /// Path to the manager script.
        script: PathBuf,
        /// Run the script through `sudo -n`.
        #[serde(default = "default_sudo")]
        sudo: bool,
    },
    /// Spawn the VM engine as a local process.
    Process {
        /// VMM program.
        program: PathBuf,
        /// Arguments; `{memory_mb}`, `{vcpus}` and `{name}` are expanded.
        #[serde(default)]
        args: Vec<String>,
        /// Time between SIGTERM and SIGKILL.
        #[serde(default = "default_stop_grace")]
        stop_grace: HumanDuration,
    },
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Script {
            script: PathBuf::from("./vm-manager.sh"),
            sudo: default_sudo(),
        }
    }
}

fn default_sudo() -> bool {
    true
}

fn default_stop_grace() -> HumanDuration {
    HumanDuration::new(Duration::from_secs(10))
}

/// Global supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Configuration format version.
    pub version: u8,

    /// Host memory available to VMs, in MiB.
    pub memory_mb: u64,

    /// Host vCPUs available to VMs.
    pub vcpus: u32,

    /// Registry database file. Empty disables persistence.
    pub state_path: PathBuf,

    /// What happens to destroyed records.
    pub retention: RetentionPolicy,

    /// Default bound on driver provisioning.
    pub provision_timeout: HumanDuration,

    /// Default bound on driver teardown.
    pub stop_timeout: HumanDuration,

    /// Bound on live queries made by `info` and the health monitor.
    pub query_timeout: HumanDuration,

    /// Health monitor period. Zero disables the monitor.
    pub monitor_interval: HumanDuration,

    /// Hypervisor driver.
    pub driver: DriverConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            version: 1,
            memory_mb: 4096,
            vcpus: 4,
            state_path: default_state_path(),
            retention: RetentionPolicy::default(),
            provision_timeout: HumanDuration::new(Duration::from_secs(120)),
            stop_timeout: HumanDuration::new(Duration::from_secs(30)),
            query_timeout: HumanDuration::new(Duration::from_secs(5)),
            monitor_interval: HumanDuration::new(Duration::from_secs(5)),
            driver: DriverConfig::default(),
        }
    }
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(APP_NAME)
        .join("state.redb")
}

impl SupervisorConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join("config.toml"))
    }

    /// Load configuration from `$VMSUP_CONFIG` or the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(Self::default_path);
        match path {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(Error::Config("memory_mb must be greater than 0".into()));
        }
        if self.vcpus == 0 {
            return Err(Error::Config("vcpus must be at least 1".into()));
        }
        if self.provision_timeout.get().is_zero() || self.stop_timeout.get().is_zero() {
            return Err(Error::Config("driver timeouts must be non-zero".into()));
        }
        match &self.driver {
            DriverConfig::Script { script, .. } if script.as_os_str().is_empty() => {
                Err(Error::Config("driver.script cannot be empty".into()))
            }
            DriverConfig::Process { program, .. } if program.as_os_str().is_empty() => {
                Err(Error::Config("driver.program cannot be empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Registry database path, or `None` when persistence is disabled.
    pub fn store_path(&self) -> Option<&Path> {
        if self.state_path.as_os_str().is_empty() {
            None
        } else {
            Some(&self.state_path)
        }
    }

    /// Health monitor period, or `None` when disabled.
    pub fn monitor_period(&self) -> Option<Duration> {
        let period = self.monitor_interval.get();
        (!period.is_zero()).then_some(period)
    }
}
