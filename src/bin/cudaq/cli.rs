use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use cudaq::core::job::JobStatus;
use cudaq::core::scheduler::PlacementPolicy;
use cudaq::core::JobId;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "cudaq",
    author,
    version = cudaq::core::version(),
    about = "Dispatches shell commands onto GPUs with enough free memory"
)]
#[command(styles = cudaq::utils::STYLES)]
pub struct Cudaq {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use (TOML or YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Job ledger path (overrides `jobs_file`)
    #[arg(long, global = true, value_name = "PATH")]
    pub jobs_file: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the dispatcher until interrupted
    Run(RunArgs),
    /// List every job in the ledger
    Status {
        /// Only show jobs in this state (pending, running, completed, failed)
        #[arg(long, short)]
        state: Option<JobStatus>,
    },
    /// Show one job with its status history
    Show {
        /// Job ID
        id: JobId,
    },
    /// Generate shell completion scripts
    Completion {
        /// The shell to generate the completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Limit which GPUs jobs may use (e.g., "0,2" or "0-3")
    #[arg(long, value_name = "INDICES")]
    pub gpus: Option<String>,

    /// Minimum free memory (MB) a GPU needs before a job is placed on it
    #[arg(long, value_name = "MB")]
    pub min_free_mem: Option<u64>,

    /// Seconds between scheduling cycles
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval: Option<u64>,

    /// File with one shell command per line
    #[arg(long, value_name = "PATH")]
    pub commands_file: Option<PathBuf>,

    /// Directory for job logs and the dispatcher log
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Placement policy (exclusive, shared)
    #[arg(long)]
    pub placement: Option<PlacementPolicy>,
}
