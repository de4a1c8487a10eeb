//! One pipeline cycle (`patchline run`).

use anyhow::{Result, bail};
use std::path::Path;

use super::super::Cli;

pub fn cmd_run(cli: &Cli, project_dir: &Path, id: Option<&str>, interactive: bool) -> Result<()> {
    use patchline::config::Config;
    use patchline::orchestrator::{Orchestrator, Selection};

    let config = Config::load(project_dir)?;
    if !config.is_initialized() {
        bail!("Project not initialized. Run 'patchline init' first.");
    }

    let selection = match (id, interactive) {
        (Some(id), _) => Selection::Id(id.to_string()),
        (None, true) => Selection::Interactive,
        (None, false) => Selection::FirstAvailable,
    };

    let mut orchestrator = Orchestrator::from_config(&config, cli.yes)?;
    let result = orchestrator.run_cycle(selection);
    orchestrator.wait_for_analysis();
    let report = result?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.success {
        bail!("Cycle failed: {}", report.summary());
    }
    Ok(())
}

fn print_report(report: &patchline::orchestrator::CycleReport) {
    println!();
    if report.success {
        println!("{} {}", console::style("✓").green().bold(), report.summary());
    } else if report.no_op {
        println!("{} {}", console::style("=").yellow().bold(), report.summary());
    } else {
        println!("{} {}", console::style("✗").red().bold(), report.summary());
    }

    for review in &report.reviews {
        let mark = if review.verdict.pass {
            console::style("pass").green()
        } else {
            console::style("fail").red()
        };
        println!("  review {:<10} {} {}", review.gate, mark, review.verdict.comments);
    }
    if let Some(tests) = &report.test_report {
        println!(
            "  tests  {} ({} ms, exit {:?})",
            if tests.passed { "passed" } else { "failed" },
            tests.duration_ms,
            tests.exit_code
        );
        if !tests.passed && !tests.output.trim().is_empty() {
            for line in tests.output.lines().take(20) {
                println!("    {}", console::style(line).dim());
            }
        }
    }
    if report.rolled_back {
        println!("  working tree rolled back");
    }
    if !report.remediation.is_empty() {
        println!("  follow-up tasks: {}", report.remediation.join(", "));
    }
    println!();
}
