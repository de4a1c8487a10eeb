//! Audit trail view (`patchline history`).

use anyhow::Result;
use std::path::Path;

pub fn cmd_history(project_dir: &Path, id: Option<&str>) -> Result<()> {
    use patchline::config::Config;
    use patchline::ledger::AuditLedger;

    let config = Config::load(project_dir)?;
    let ledger = AuditLedger::open(config.ledger_file())?;
    let records = ledger.load()?;

    let records: Vec<_> = match id {
        Some(id) => records
            .into_iter()
            .filter(|r| r.task_id == id || r.task_id.starts_with(id))
            .collect(),
        None => records,
    };

    if records.is_empty() {
        println!("(No audit records)");
        return Ok(());
    }

    for record in &records {
        println!();
        println!(
            "{} (since {})",
            console::style(&record.task_id).cyan().bold(),
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        for snapshot in &record.history {
            let state = if snapshot.state.starts_with("failed_") || snapshot.state == "rollback_failed" {
                console::style(&snapshot.state).red()
            } else {
                console::style(&snapshot.state).green()
            };
            println!(
                "  {}  {}",
                snapshot.timestamp.format("%H:%M:%S%.3f"),
                state
            );
        }
        if !record.iterations.is_empty() {
            println!("  {} iteration(s) of telemetry", record.iterations.len());
        }
    }
    println!();
    Ok(())
}
