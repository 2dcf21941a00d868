//! tasklane CLI: the main entry point.
//!
//! Commands:
//! - `run`        : Start a task and answer its questions in the terminal
//! - `resume`     : Continue a stored task
//! - `history`    : List stored tasks
//! - `checkpoints`: List, diff or restore a task's workspace checkpoints
//! - `bridge`     : Relay questions between the IPC mailbox and Telegram
//! - `onboard`    : Write a default config

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tasklane_agent::RestoreMode;

mod commands;

#[derive(Parser)]
#[command(
    name = "tasklane",
    about = "tasklane — autonomous coding tasks with checkpoints and sub-tasks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new task
    Run {
        /// What the task should accomplish
        task: String,

        /// Mode to start in (code, architect, ask, orchestrator, ...)
        #[arg(short, long)]
        mode: Option<String>,

        /// Workspace directory (defaults to TASKLANE_WORKSPACE or the current dir)
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Replay model responses from a JSON script instead of calling a provider
        #[arg(long)]
        script: Option<PathBuf>,

        /// Approve every tool call without asking
        #[arg(long)]
        auto_approve: bool,
    },

    /// Resume a stored task
    Resume {
        task_id: String,

        #[arg(short, long)]
        workspace: Option<PathBuf>,

        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// List stored tasks, newest first
    History {
        /// Show at most this many tasks
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// List a task's checkpoints, or restore one
    Checkpoints {
        task_id: String,

        /// Hash (or unique prefix) of the checkpoint to restore
        #[arg(long)]
        restore: Option<String>,

        /// What a restore rewinds
        #[arg(long, value_enum, default_value_t = RestoreArg::FilesAndTask)]
        mode: RestoreArg,

        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Run the Telegram bridge over the IPC mailbox
    Bridge,

    /// Write a default config to ~/.tasklane/config.toml
    Onboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RestoreArg {
    Files,
    Task,
    FilesAndTask,
}

impl From<RestoreArg> for RestoreMode {
    fn from(arg: RestoreArg) -> Self {
        match arg {
            RestoreArg::Files => RestoreMode::FilesOnly,
            RestoreArg::Task => RestoreMode::TaskOnly,
            RestoreArg::FilesAndTask => RestoreMode::FilesAndTask,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { task, mode, workspace, script, auto_approve } => {
            let opts = commands::run::Options { workspace, script, auto_approve };
            let completed = commands::run::run(task, mode, opts).await?;
            // stdin may still be held by a blocking read; don't wait on it
            std::process::exit(if completed { 0 } else { 1 });
        }
        Commands::Resume { task_id, workspace, script } => {
            let opts = commands::run::Options { workspace, script, auto_approve: false };
            let completed = commands::run::resume(task_id, opts).await?;
            std::process::exit(if completed { 0 } else { 1 });
        }
        Commands::History { limit } => commands::history::run(limit).await?,
        Commands::Checkpoints { task_id, restore, mode, workspace } => {
            commands::checkpoints::run(task_id, restore, mode.into(), workspace).await?
        }
        Commands::Bridge => commands::bridge::run().await?,
        Commands::Onboard => commands::onboard::run().await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "tasklane", "run", "fix the build", "--mode", "architect", "--auto-approve", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { task, mode, auto_approve, script, .. } => {
                assert_eq!(task, "fix the build");
                assert_eq!(mode.as_deref(), Some("architect"));
                assert!(auto_approve);
                assert!(script.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn checkpoint_restore_mode_defaults_to_both() {
        let cli = Cli::try_parse_from(["tasklane", "checkpoints", "abc", "--restore", "f00d"]).unwrap();
        match cli.command {
            Commands::Checkpoints { restore, mode, .. } => {
                assert_eq!(restore.as_deref(), Some("f00d"));
                assert_eq!(RestoreMode::from(mode), RestoreMode::FilesAndTask);
            }
            _ => panic!("expected checkpoints"),
        }

        let cli = Cli::try_parse_from(["tasklane", "checkpoints", "abc", "--mode", "files"]).unwrap();
        assert!(matches!(cli.command, Commands::Checkpoints { mode: RestoreArg::Files, .. }));
    }

    #[test]
    fn run_requires_a_task() {
        assert!(Cli::try_parse_from(["tasklane", "run"]).is_err());
    }
}
