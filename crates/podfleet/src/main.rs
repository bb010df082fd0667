use anyhow::Result;
use clap::Parser;
use podfleet::cmd;
use podfleet::config::{Cli, Commands};
use podfleet::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(&cli.cluster.log_file);

    tracing::info!("Starting podfleet {}", &**version::VERSION);

    match cli.command {
        Commands::Check => cmd::run_check(&cli.cluster).await,
        Commands::Run(run_args) => cmd::run_load_test(&cli.cluster, &run_args).await,
        Commands::Exec(exec_args) => cmd::run_exec(&cli.cluster, &exec_args).await,
        Commands::Teardown(teardown_args) => cmd::run_teardown(&cli.cluster, &teardown_args).await,
    }
}
