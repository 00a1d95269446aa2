//! vmsup CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmsup::{Supervisor, SupervisorConfig};

mod cli;

/// vmsup - VM lifecycle supervisor
#[derive(Parser, Debug)]
#[command(name = "vmsup")]
#[command(about = "VM lifecycle supervisor")]
#[command(version)]
struct Cli {
    /// Configuration file (default: $VMSUP_CONFIG or the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare the host for running VMs.
    Init(cli::init::InitCmd),

    /// Create and start a VM.
    #[command(alias = "start")]
    Create(cli::create::CreateCmd),

    /// Stop a running VM.
    Stop(cli::stop::StopCmd),

    /// Remove a stopped or failed VM.
    #[command(alias = "rm")]
    Destroy(cli::destroy::DestroyCmd),

    /// List VMs.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Show details of one VM.
    Info(cli::info::InfoCmd),

    /// Show host capacity and reservations.
    Capacity(cli::capacity::CapacityCmd),

    /// Run the supervisor with the health monitor until interrupted.
    Serve(cli::serve::ServeCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.log_format);

    tracing::debug!(version = vmsup::VERSION, "starting vmsup");

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> vmsup::Result<()> {
    let config = match &cli.config {
        Some(path) => SupervisorConfig::load_from(path)?,
        None => SupervisorConfig::load()?,
    };

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        let supervisor = Supervisor::open(config).await?;

        let result = match cli.command {
            Commands::Serve(cmd) => return cmd.run(supervisor).await,
            Commands::Init(cmd) => cmd.run(&supervisor).await,
            Commands::Create(cmd) => cmd.run(&supervisor).await,
            Commands::Stop(cmd) => cmd.run(&supervisor).await,
            Commands::Destroy(cmd) => cmd.run(&supervisor).await,
            Commands::List(cmd) => cmd.run(&supervisor).await,
            Commands::Info(cmd) => cmd.run(&supervisor).await,
            Commands::Capacity(cmd) => cmd.run(&supervisor).await,
        };

        supervisor.shutdown().await;
        result
    })
}

/// Initialize the tracing subscriber.
fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmsup=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
