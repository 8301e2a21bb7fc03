// src/cli/args.rs

use clap::Parser;
use std::path::PathBuf;

/// The global command line of the `poe` binary. Only tokens before the task
/// name are ours; everything after it belongs to the task, including tokens
/// that look like our own flags.
#[derive(Parser, Debug)]
#[command(
    name = "poe",
    version,
    about = "A task runner that works well with pyproject.toml projects",
    disable_help_flag = true
)]
pub struct Cli {
    /// Show help and exit. Handled by the orchestrator so the task list can
    /// come from the loaded config.
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    /// More output (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less output (repeatable).
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Print task commands without executing them.
    #[arg(short = 'd', long = "dry-run")]
    pub dry_run: bool,

    /// Config file to use, or directory to start the config search from.
    #[arg(long, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Force colored output.
    #[arg(long, overrides_with = "no_ansi")]
    pub ansi: bool,

    /// Disable colored output.
    #[arg(long = "no-ansi", overrides_with = "ansi")]
    pub no_ansi: bool,

    /// The task to run, followed by its arguments. Captured as one list so
    /// that the task name starts the verbatim capture; task names cannot
    /// begin with `-`, so the first entry is always the task.
    #[arg(
        value_name = "task",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub task_and_args: Vec<String>,
}

impl Cli {
    pub fn task(&self) -> Option<&str> {
        self.task_and_args.first().map(String::as_str)
    }

    pub fn task_args(&self) -> &[String] {
        self.task_and_args.get(1..).unwrap_or(&[])
    }

    /// Net verbosity adjustment from the repeatable `-v`/`-q` flags, applied
    /// on top of the configured verbosity.
    pub fn verbosity_adjustment(&self) -> i64 {
        i64::from(self.verbose) - i64::from(self.quiet)
    }

    /// The tri-state ANSI override: `--ansi`, `--no-ansi`, or autodetect.
    pub fn ansi_override(&self) -> Option<bool> {
        if self.ansi {
            Some(true)
        } else if self.no_ansi {
            Some(false)
        } else {
            None
        }
    }
}

// MARK: --- UNIT TESTS ---
