use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use utils::version;

use crate::config::fleet::FleetArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the cluster API server is reachable and healthy
    Check,
    /// Bring up the worker fleet and run the load test on it
    Run(Box<RunArgs>),
    /// Run one shell command on every ready worker
    Exec(ExecArgs),
    /// Delete every worker pod carrying the fleet label
    Teardown(TeardownArgs),
}

/// Connection and logging options shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct ClusterArgs {
    #[arg(
        long,
        global = true,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "PODFLEET_CONTEXT",
        help = "Kubeconfig context to use instead of the current one"
    )]
    pub context: Option<String>,

    #[arg(
        long,
        global = true,
        env = "PODFLEET_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "logs/podfleet.log",
        help = "Run log file, rotated daily"
    )]
    pub log_file: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub fleet: FleetArgs,

    #[arg(
        long = "scenario",
        value_hint = clap::ValueHint::FilePath,
        help = "Scenario file, repeat to hand out several round-robin"
    )]
    pub scenarios: Vec<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Properties file, repeat to hand out several round-robin"
    )]
    pub properties: Vec<PathBuf>,

    #[arg(
        long = "command",
        help = "Load-test command template, supports {scenario} {properties} {results} {pod}"
    )]
    pub command_template: Option<String>,

    #[arg(long, help = "Skip the setup steps, e.g. when the image already has JMeter")]
    pub skip_setup: bool,

    #[arg(long, help = "Cancel steps still running after this many seconds")]
    pub deadline_secs: Option<u64>,

    #[arg(long, short = 'y', help = "Start without asking for confirmation")]
    pub yes: bool,

    #[arg(long, help = "Leave the workers running after the run")]
    pub keep_fleet: bool,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Write the run report as JSON to this path"
    )]
    pub report: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub fleet: FleetArgs,

    /// Shell command, run through `/bin/sh -c`
    pub command: String,

    #[arg(long, help = "Give up on commands still running after this many seconds")]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Clone, Debug)]
pub struct TeardownArgs {
    #[command(flatten)]
    pub fleet: FleetArgs,
}
