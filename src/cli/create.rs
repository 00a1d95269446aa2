//! Create command implementation.

use clap::Args;
use std::time::Duration;
use vmsup::{CreateRequest, Supervisor, VmState};

use crate::cli::{format_mib, parse_duration, print_json};

/// Extra time on top of the provisioning bound before giving up waiting.
const SETTLE_SLACK: Duration = Duration::from_secs(5);

/// Create and start a VM.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// Memory in MiB.
    pub memory_mb: u32,

    /// Number of vCPUs.
    pub vcpus: u32,

    /// Label for the VM.
    #[arg(default_value = "")]
    pub name: String,

    /// Provisioning timeout (e.g. "90s"); the configured default otherwise.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CreateCmd {
    /// Execute the create command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let bound = self
            .timeout
            .unwrap_or_else(|| supervisor.config().provision_timeout.get());

        let mut request = CreateRequest::new(self.memory_mb, self.vcpus, self.name.clone());
        request.timeout = self.timeout;

        let vms = supervisor.dispatcher();
        let id = vms.create(request).await?;
        if !self.json {
            println!(
                "Creating VM {} ({}, {} vCPU)...",
                id,
                format_mib(u64::from(self.memory_mb)),
                self.vcpus
            );
        }

        let vm = vms.wait_until_settled(&id, bound + SETTLE_SLACK).await?;

        if self.json {
            print_json(&vm)?;
        } else if vm.state == VmState::Running {
            println!("Started VM: {}", id);
        }

        if vm.state != VmState::Running {
            if let Some(reason) = &vm.last_error {
                eprintln!("VM {} failed: {}", id, reason);
            }
            return Err(vmsup::Error::invalid_state(&id, "running", vm.state));
        }
        Ok(())
    }
}
