//! Project initialization (`patchline init`).

use anyhow::{Result, bail};
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use patchline::config::{Config, PatchlineToml};

    if git2::Repository::discover(project_dir).is_err() {
        bail!(
            "{} is not inside a git repository. Run 'git init' first.",
            project_dir.display()
        );
    }

    let config = Config::load(project_dir)?;
    let created = config.ensure_state_dir()?;
    let config_path = config.config_path();
    let wrote_config = !config_path.exists();
    if wrote_config {
        PatchlineToml::default().save(&config_path)?;
    }

    if created {
        println!(
            "Initialized patchline at {}",
            console::style(config.state_dir.display()).bold()
        );
        println!();
        println!("Created directory structure:");
        println!("  .patchline/");
        println!("  ├── .gitignore      # Keeps pipeline state out of commits");
        println!("  ├── patchline.toml  # Pipeline configuration");
        println!("  ├── tasks.json      # Task backlog (created on first add)");
        println!("  └── ledger.json     # Audit ledger (created on first run)");
        println!();
        println!("Next steps:");
        println!("  1. Set `test_command` in .patchline/patchline.toml");
        println!("  2. Run `patchline add --title ... --change-set edits.json`");
        println!("  3. Run `patchline run`");
    } else {
        println!(
            "patchline already initialized at {}",
            config.state_dir.display()
        );
        if wrote_config {
            println!("Wrote default {}", config_path.display());
        }
    }
    Ok(())
}
