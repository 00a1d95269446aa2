//! Stop command implementation.

use clap::Args;
use std::time::Duration;
use vmsup::{Supervisor, VmId};

use crate::cli::parse_duration;

/// Stop a running VM.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// VM id to stop.
    pub id: String,

    /// Teardown timeout (e.g. "30s"); the configured default otherwise.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl StopCmd {
    /// Execute the stop command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let id = VmId::from(self.id);
        println!("Stopping VM {}...", id);

        let vm = supervisor.dispatcher().stop(&id, self.timeout).await?;
        println!("Stopped VM: {} ({})", vm.id, vm.state);
        Ok(())
    }
}
