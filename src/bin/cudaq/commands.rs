use crate::cli::{Commands, Cudaq, RunArgs};
use anyhow::{Context, Result};
use cudaq::config::Config;

pub mod run;
pub mod show;
pub mod status;

/// Load configuration and apply CLI overrides on top.
pub fn resolve_config(args: &Cudaq) -> Result<Config> {
    let mut config =
        cudaq::config::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(jobs_file) = &args.jobs_file {
        config.jobs_file = jobs_file.clone();
    }
    if let Commands::Run(run_args) = &args.command {
        apply_run_overrides(&mut config, run_args)?;
    }
    Ok(config)
}

fn apply_run_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(gpu_spec) = &args.gpus {
        config.gpu_ids = Some(cudaq::utils::parse_gpu_indices(gpu_spec)?);
    }
    if let Some(mb) = args.min_free_mem {
        config.min_free_mem_mb = mb;
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval = secs;
    }
    if let Some(path) = &args.commands_file {
        config.commands_file = path.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(policy) = args.placement {
        config.placement = policy;
    }
    Ok(())
}

pub async fn handle_commands(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run(_) => run::handle_run(config).await,
        Commands::Status { state } => status::handle_status(config, state),
        Commands::Show { id } => show::handle_show(config, id),
        Commands::Completion { .. } => Ok(()),
    }
}
