// src/bin/poe.rs

use clap::Parser;
use colored::Colorize;
use poe::cli::Cli;
use poe::constants::EXIT_INTERRUPTED;
use poe::core::orchestrator::{self, RunRequest};
use poe::ui::Ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The entry point of the `poe` binary: set up logging and the Ctrl+C flag,
/// parse the global command line, and hand everything to the orchestrator.
/// Error handling is centralized here so every failure path maps to one
/// exit code.
fn main() {
    env_logger::init();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)) {
            // Without the handler Ctrl+C still kills us, just less tidily.
            log::warn!("Could not install the Ctrl+C handler: {e}");
        }
    }

    let cli = Cli::parse();
    Ui::apply_ansi_override(cli.ansi_override());
    log::debug!("CLI args parsed: {cli:?}");

    let invocation_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let task = cli.task().map(str::to_string);
    let args = cli.task_args().to_vec();
    let verbosity_adjustment = cli.verbosity_adjustment();
    let request = RunRequest {
        task,
        args,
        root: cli.root,
        invocation_cwd,
        dry_run: cli.dry_run,
        help: cli.help,
        verbosity_adjustment,
        cancel,
    };

    match orchestrator::run(request) {
        Ok(code) => std::process::exit(code),
        Err(e) if e.is_interrupted() => {
            // Exit silently with the shell convention for interruption.
            std::process::exit(EXIT_INTERRUPTED);
        }
        Err(e) => {
            eprintln!("\n{}: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}
