//! Destroy command implementation.

use clap::Args;
use vmsup::{Supervisor, VmId};

/// Remove a stopped or failed VM.
#[derive(Args, Debug)]
pub struct DestroyCmd {
    /// VM id to destroy.
    pub id: String,
}

impl DestroyCmd {
    /// Execute the destroy command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let id = VmId::from(self.id);
        supervisor.dispatcher().destroy(&id).await?;
        println!("Destroyed VM: {}", id);
        Ok(())
    }
}
