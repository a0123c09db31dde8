use anyhow::{Context, Result};
use cudaq::config::Config;
use cudaq::core::job::JobStatus;
use cudaq::core::ledger::Ledger;
use cudaq::core::status::{self, StatusRow};
use owo_colors::OwoColorize;
use strum::IntoEnumIterator;
use tabled::{settings::Style, Table, Tabled};

const COMMAND_WIDTH: usize = 60;

pub fn handle_status(config: &Config, state: Option<JobStatus>) -> Result<()> {
    let records = Ledger::load(&config.jobs_file)
        .with_context(|| format!("Failed to read ledger {}", config.jobs_file.display()))?;

    let rows: Vec<StatusRow> = status::rows(&records)
        .into_iter()
        .filter(|row| state.is_none_or(|s| row.status == s))
        .collect();

    if rows.is_empty() {
        println!("No jobs found.");
    } else {
        println!("{}", render_table(&rows));
    }
    println!("{}", summary(&records));
    Ok(())
}

#[derive(Tabled)]
struct TableRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "GPU")]
    gpu: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "COMMAND")]
    command: String,
}

fn state_cell(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => format!("[✓] {status}").green().to_string(),
        JobStatus::Running => format!("[→] {status}").cyan().to_string(),
        JobStatus::Failed => format!("[!] {status}").red().to_string(),
        JobStatus::Pending => format!("[ ] {status}").dimmed().to_string(),
    }
}

fn render_table(rows: &[StatusRow]) -> String {
    let rows: Vec<TableRow> = rows
        .iter()
        .map(|row| TableRow {
            id: row.id.to_string(),
            state: state_cell(row.status),
            gpu: row.gpu_label(),
            pid: row
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            command: cudaq::utils::truncate_command(&row.command, COMMAND_WIDTH),
        })
        .collect();
    Table::new(&rows).with(Style::empty()).to_string()
}

fn summary(records: &[cudaq::core::job::JobRecord]) -> String {
    let counts = status::counts_by_status(records);
    let parts: Vec<String> = JobStatus::iter()
        .map(|s| format!("{} {}", counts.get(&s).copied().unwrap_or(0), s))
        .collect();
    format!("{} jobs: {}", records.len(), parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cudaq::core::job::JobRecord;
    use std::path::PathBuf;

    fn records() -> Vec<JobRecord> {
        let mut running = JobRecord::new_pending(1, "python train.py", PathBuf::from("logs/job_1.log"), None);
        running.mark_running(0, 4242, None, None).unwrap();
        let pending = JobRecord::new_pending(2, "python eval.py", PathBuf::from("logs/job_2.log"), None);
        vec![running, pending]
    }

    #[test]
    fn test_render_table() {
        let table = render_table(&status::rows(&records()));
        assert!(table.contains("python train.py"));
        assert!(table.contains("4242"));
        assert!(table.contains("none"));
        assert!(table.contains("[→] Running"));
        assert!(table.contains("[ ] Pending"));
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            summary(&records()),
            "2 jobs: 1 Pending, 1 Running, 0 Completed, 0 Failed"
        );
    }
}
