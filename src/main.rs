use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "patchline")]
#[command(version, about = "Verified patch pipeline with rollback and an audit ledger")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve patches without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    /// Emit JSON (cycle reports on stdout, logs on stderr)
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .patchline/ with a default configuration
    Init,
    /// Show the effective configuration
    Config,
    /// List tasks
    List {
        /// open, in_progress, done, archived, blocked or all
        #[arg(short, long, default_value = "open")]
        status: String,
    },
    /// Add a task to the backlog
    Add {
        #[arg(short, long)]
        title: String,

        /// micro, story, epic or blueprint
        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long)]
        parent: Option<String>,

        /// JSON change set: {message, author, meta, edits}
        #[arg(long, conflicts_with_all = ["patch", "legacy_diff"])]
        change_set: Option<PathBuf>,

        /// Ready-made unified diff
        #[arg(long, conflicts_with = "legacy_diff")]
        patch: Option<PathBuf>,

        /// JSON descriptor: {file, before, after}
        #[arg(long)]
        legacy_diff: Option<PathBuf>,
    },
    /// Archive a task
    Remove { id: String },
    /// Archive every completed task
    Archive,
    /// Run one task through build, review, apply, test and commit
    Run {
        /// Task id to run (defaults to the first executable open task)
        #[arg(long)]
        id: Option<String>,

        /// Pick the task from a prompt
        #[arg(short, long)]
        interactive: bool,
    },
    /// Show the audit ledger
    History {
        /// Task id or id prefix
        #[arg(long)]
        id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    patchline::logging::init(cli.verbose, cli.json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Config => cmd::cmd_config(&project_dir)?,
        Commands::List { status } => cmd::cmd_list(&project_dir, status)?,
        Commands::Add {
            title,
            kind,
            description,
            parent,
            change_set,
            patch,
            legacy_diff,
        } => cmd::cmd_add(
            &project_dir,
            cmd::tasks::AddArgs {
                title,
                kind: kind.as_deref(),
                description: description.as_deref(),
                parent: parent.as_deref(),
                change_set: change_set.as_deref(),
                patch: patch.as_deref(),
                legacy: legacy_diff.as_deref(),
            },
        )?,
        Commands::Remove { id } => cmd::cmd_remove(&project_dir, id)?,
        Commands::Archive => cmd::cmd_archive(&project_dir)?,
        Commands::Run { id, interactive } => {
            cmd::cmd_run(&cli, &project_dir, id.as_deref(), *interactive)?
        }
        Commands::History { id } => cmd::cmd_history(&project_dir, id.as_deref())?,
    }

    Ok(())
}
