//! List command implementation.

use clap::Args;
use vmsup::util::truncate;
use vmsup::{ListFilter, Supervisor, VmState};

use crate::cli::{format_mib, print_json};

/// List VMs.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Only VMs in this state.
    #[arg(long)]
    pub state: Option<VmState>,

    /// Only VMs with this name.
    #[arg(long)]
    pub name: Option<String>,

    /// Hide destroyed VMs.
    #[arg(long)]
    pub live: bool,

    /// Show detailed output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let filter = ListFilter {
            state: self.state,
            name: self.name.clone(),
            exclude_destroyed: self.live,
        };
        let vms = supervisor.dispatcher().list_filtered(&filter);

        if self.json {
            return print_json(&vms);
        }

        if vms.is_empty() {
            println!("No VMs found");
            return Ok(());
        }

        println!(
            "{:<38} {:<16} {:<10} {:<5} {:<10}",
            "ID", "NAME", "STATE", "CPUS", "MEMORY"
        );
        println!("{}", "-".repeat(82));

        for vm in vms {
            println!(
                "{:<38} {:<16} {:<10} {:<5} {:<10}",
                vm.id,
                truncate(&vm.name, 16),
                vm.state,
                vm.vcpus,
                format_mib(u64::from(vm.memory_mb)),
            );

            if self.verbose {
                println!("  Created: {}", vm.created_at);
                println!("  Last transition: {}", vm.last_transition_at);
                if let Some(err) = &vm.last_error {
                    println!("  Error: {}", err);
                }
                println!();
            }
        }

        Ok(())
    }
}
