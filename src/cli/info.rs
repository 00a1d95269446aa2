//! Info command implementation.

use clap::Args;
use vmsup::{Supervisor, VmId};

use crate::cli::{format_mib, print_json};

/// Show details of one VM.
#[derive(Args, Debug)]
pub struct InfoCmd {
    /// VM id.
    pub id: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl InfoCmd {
    /// Execute the info command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let vm = supervisor.dispatcher().info(&VmId::from(self.id)).await?;

        if self.json {
            return print_json(&vm);
        }

        println!("ID:       {}", vm.id);
        println!("Name:     {}", vm.name);
        println!("State:    {}", vm.state);
        println!("vCPUs:    {}", vm.vcpus);
        println!("Memory:   {}", format_mib(u64::from(vm.memory_mb)));
        println!("Created:  {}", vm.created_at);
        println!("Changed:  {}", vm.last_transition_at);
        if let Some(err) = &vm.last_error {
            println!("Error:    {}", err);
        }

        if let Some(runtime) = &vm.runtime {
            println!("Alive:    {}", runtime.alive);
            if let Some(pid) = runtime.pid {
                println!("PID:      {}", pid);
            }
            if let Some(rss) = runtime.rss_mb {
                println!("RSS:      {}", format_mib(rss));
            }
            for (key, value) in &runtime.extra {
                println!("{:<9} {}", format!("{}:", key), value);
            }
        }

        Ok(())
    }
}
