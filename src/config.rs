use crate::core::scheduler::PlacementPolicy;
use crate::core::GpuId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Limit which GPUs the dispatcher may use (None = all detected GPUs)
    #[serde(default)]
    pub gpu_ids: Option<Vec<GpuId>>,
    /// Free memory a GPU must report before a job is placed on it
    #[serde(default = "default_min_free_mem_mb")]
    pub min_free_mem_mb: u64,
    /// Seconds between scheduling cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_commands_file")]
    pub commands_file: PathBuf,
    /// Job logs and the dispatcher's own log
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Ledger path
    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,
    #[serde(default)]
    pub placement: PlacementPolicy,
}

fn default_min_free_mem_mb() -> u64 {
    6000
}

fn default_poll_interval() -> u64 {
    60
}

fn default_commands_file() -> PathBuf {
    PathBuf::from("commands.txt")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_jobs_file() -> PathBuf {
    PathBuf::from("./jobs.jsonl")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpu_ids: None,
            min_free_mem_mb: default_min_free_mem_mb(),
            poll_interval: default_poll_interval(),
            commands_file: default_commands_file(),
            log_dir: default_log_dir(),
            jobs_file: default_jobs_file(),
            placement: PlacementPolicy::default(),
        }
    }
}

impl Config {
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

/// Load configuration: defaults, then `cudaq.{toml,yaml}` in the working
/// directory or the file given explicitly, then `CUDAQ_*` environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, config::ConfigError> {
    build_config(config_path, env_source())
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("CUDAQ")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("gpu_ids")
}

fn build_config(
    config_path: Option<&Path>,
    env: config::Environment,
) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder();
    let settings = match config_path {
        // Explicit file must exist; format follows the extension
        Some(path) => settings.add_source(config::File::from(path).required(true)),
        None => settings.add_source(config::File::with_name("cudaq").required(false)),
    };

    let config: Config = settings.add_source(env).build()?.try_deserialize()?;
    if config.poll_interval == 0 {
        return Err(config::ConfigError::Message(
            "poll_interval must be at least 1 second".to_string(),
        ));
    }
    Ok(config)
}
