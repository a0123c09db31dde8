use anyhow::{Context, Result};
use cudaq::config::Config;
use cudaq::core::gpu::{resolve_gpu_ids, GpuProber, NvmlProber};
use cudaq::core::launcher::ShellLauncher;
use cudaq::core::ledger::Ledger;
use cudaq::core::scheduler::SchedulerBuilder;
use tokio::signal::unix::{signal, SignalKind};

pub async fn handle_run(config: &Config) -> Result<()> {
    let prober = NvmlProber::init();
    let detected = prober.discover().unwrap_or_else(|e| {
        tracing::warn!("GPU discovery failed: {:#}", e);
        Vec::new()
    });
    let gpu_ids = resolve_gpu_ids(config.gpu_ids.as_deref(), &detected);
    if gpu_ids.is_empty() {
        tracing::warn!("No usable GPUs; jobs will stay pending");
    }

    let ledger = Ledger::open(&config.jobs_file)
        .with_context(|| format!("Failed to open ledger {}", config.jobs_file.display()))?;

    let mut scheduler = SchedulerBuilder::new()
        .with_prober(Box::new(prober))
        .with_launcher(Box::new(ShellLauncher::new()))
        .with_gpu_ids(gpu_ids)
        .with_min_free_mem_mb(config.min_free_mem_mb)
        .with_policy(config.placement)
        .with_log_dir(config.log_dir.clone())
        .with_commands_file(Some(config.commands_file.clone()))
        .build(ledger);

    let recovery = scheduler.recover().context("Recovery pass failed")?;
    if !recovery.adopted.is_empty() || !recovery.orphaned.is_empty() {
        tracing::info!(
            "Recovered ledger: adopted {:?}, orphaned {:?}",
            recovery.adopted,
            recovery.orphaned
        );
    }

    scheduler
        .run_until(config.poll_duration(), shutdown_signal())
        .await
        .context("Dispatcher stopped on a fatal error")?;
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, stopping dispatcher");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, stopping dispatcher");
        }
    }
}
