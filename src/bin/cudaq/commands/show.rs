use anyhow::{Context, Result};
use cudaq::config::Config;
use cudaq::core::error::DispatchError;
use cudaq::core::job::JobRecord;
use cudaq::core::ledger::Ledger;
use cudaq::core::JobId;
use std::fmt::Write;

pub fn handle_show(config: &Config, id: JobId) -> Result<()> {
    let records = Ledger::load(&config.jobs_file)
        .with_context(|| format!("Failed to read ledger {}", config.jobs_file.display()))?;
    let record = records
        .iter()
        .find(|r| r.id == id)
        .ok_or(DispatchError::NotFound(id))?;
    print!("{}", describe(record)?);
    Ok(())
}

fn describe(record: &JobRecord) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "Job {}", record.id)?;
    writeln!(out, "  Command:  {}", record.command)?;
    writeln!(out, "  Status:   {}", record.status())?;
    let gpu = record
        .assigned_gpu
        .map(|g| g.to_string())
        .unwrap_or_else(|| "none".to_string());
    writeln!(out, "  GPU:      {gpu}")?;
    if let Some(pid) = record.pid {
        let host = record.host.as_deref().unwrap_or("unknown host");
        writeln!(out, "  PID:      {pid} ({host})")?;
    }
    if let Some(code) = record.exit_code {
        writeln!(out, "  Exit:     {code}")?;
    }
    if let Some(started) = record.started_at {
        writeln!(out, "  Started:  {}", started.format("%Y-%m-%d %H:%M:%S UTC"))?;
    }
    if let Some(ended) = record.ended_at {
        writeln!(out, "  Ended:    {}", ended.format("%Y-%m-%d %H:%M:%S UTC"))?;
    }
    writeln!(out, "  Log:      {}", record.log_path.display())?;
    if let Some(origin) = &record.origin {
        writeln!(out, "  Source:   {}:{}", origin.file.display(), origin.line + 1)?;
    }
    writeln!(out, "  History:")?;
    for change in record.history() {
        write!(
            out,
            "    {}  {}",
            change.at.format("%Y-%m-%d %H:%M:%S"),
            change.status
        )?;
        if let Some(note) = &change.note {
            write!(out, " ({note})")?;
        }
        out.push('\n');
    }
    Ok(out)
}
