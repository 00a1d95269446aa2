//! Init command implementation.

use clap::Args;
use vmsup::Supervisor;

/// Prepare the host for running VMs.
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Print the active configuration as TOML instead.
    #[arg(long)]
    pub print_config: bool,
}

impl InitCmd {
    /// Execute the init command.
    pub async fn run(self, supervisor: &Supervisor) -> vmsup::Result<()> {
        if self.print_config {
            let text = toml::to_string_pretty(supervisor.config())
                .map_err(|e| vmsup::Error::Config(e.to_string()))?;
            print!("{}", text);
            return Ok(());
        }

        supervisor.engine().initialize().await?;
        println!("Host initialized");

        let recovery = supervisor.recovery();
        if recovery.failed > 0 {
            println!(
                "{} interrupted VM(s) marked failed; see `vmsup list --state failed`",
                recovery.failed
            );
        }
        Ok(())
    }
}
