//! Configuration view (`patchline config`).

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_config(project_dir: &Path) -> Result<()> {
    use patchline::config::{Config, ENV_BASE_REF, ENV_TEST_COMMAND};

    let config = Config::load(project_dir)?;
    let config_path = config.config_path();

    println!();
    if config_path.exists() {
        println!("Config file: {}", config_path.display());
    } else {
        println!(
            "No patchline.toml found at {}; using defaults",
            config_path.display()
        );
    }
    println!();

    let rendered =
        toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
    println!("{}", rendered.trim_end());
    println!();

    println!("Effective values (with env overrides):");
    println!(
        "  test_command = \"{}\"{}",
        config.toml.test_command(),
        override_note(ENV_TEST_COMMAND)
    );
    println!(
        "  base_ref = \"{}\"{}",
        config.toml.base_ref(),
        override_note(ENV_BASE_REF)
    );
    println!("  tasks_file = {}", config.tasks_file().display());
    println!("  ledger_file = {}", config.ledger_file().display());
    println!();
    Ok(())
}

fn override_note(var: &str) -> String {
    if std::env::var(var).is_ok_and(|v| !v.trim().is_empty()) {
        format!("  {}", console::style(format!("(from {var})")).dim())
    } else {
        String::new()
    }
}
