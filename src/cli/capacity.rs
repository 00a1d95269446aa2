//! Capacity command implementation.

use clap::Args;
use vmsup::Supervisor;

use crate::cli::{format_mib, print_json};

/// Show host capacity and current reservations.
#[derive(Args, Debug)]
pub struct CapacityCmd {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CapacityCmd {
    /// Execute the capacity command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        let usage = supervisor.dispatcher().usage();

        if self.json {
            return print_json(&usage);
        }

        println!("{:<10} {:>12} {:>12} {:>12}", "", "TOTAL", "RESERVED", "FREE");
        println!(
            "{:<10} {:>12} {:>12} {:>12}",
            "memory",
            format_mib(usage.capacity.memory_mb),
            format_mib(usage.reserved.memory_mb),
            format_mib(usage.available.memory_mb),
        );
        println!(
            "{:<10} {:>12} {:>12} {:>12}",
            "vcpus", usage.capacity.vcpus, usage.reserved.vcpus, usage.available.vcpus,
        );
        println!("Reservations: {}", usage.reservations);
        Ok(())
    }
}
