//! Serve command implementation.

use clap::Args;
use vmsup::Supervisor;

/// Keep the supervisor running with the health monitor until interrupted.
#[derive(Args, Debug)]
pub struct ServeCmd {
    /// Run the driver's host initialization first.
    #[arg(long)]
    pub init: bool,
}

impl ServeCmd {
    /// Execute the serve command.
    pub async fn run(self, mut supervisor: Supervisor) -> vmsup::Result<()> {
        if self.init {
            supervisor.engine().initialize().await?;
        }

        supervisor.spawn_monitor();
        let usage = supervisor.dispatcher().usage();
        tracing::info!(
            reservations = usage.reservations,
            available_mb = usage.available.memory_mb,
            "supervisor serving"
        );
        println!("vmsup supervising {} VM(s); Ctrl-C to exit", usage.reservations);

        tokio::signal::ctrl_c().await?;

        tracing::info!("interrupt received, shutting down");
        supervisor.shutdown().await;
        Ok(())
    }
}
