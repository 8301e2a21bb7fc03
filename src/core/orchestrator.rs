//! Ties one CLI invocation together: load the config, build the run
//! context with the global environment layers, resolve the requested task,
//! and hand it to the task runner. Also owns the `--help` rendering.

use crate::CancellationToken;
use crate::core::config::{self, Config};
use crate::core::context::RunContext;
use crate::core::env_manager::EnvVarsManager;
use crate::core::envfile::{self, EnvFileCache};
use crate::core::tasks::Task;
use crate::errors::{PoeResult, ResolveError};
use crate::ui::Ui;

use std::path::PathBuf;

/// Everything the binary hands over after parsing the command line.
pub struct RunRequest {
    /// The task to run; `None` means show the task list.
    pub task: Option<String>,
    /// Tokens following the task name, passed through to it.
    pub args: Vec<String>,
    /// Explicit config file or search root from `--root`.
    pub root: Option<PathBuf>,
    /// The directory poe was invoked from.
    pub invocation_cwd: PathBuf,
    pub dry_run: bool,
    pub help: bool,
    /// From the `-v`/`-q` counts, added to the configured verbosity.
    pub verbosity_adjustment: i64,
    pub cancel: CancellationToken,
}

/// Runs one invocation end to end and returns the process exit code.
pub fn run(request: RunRequest) -> PoeResult<i32> {
    let config = match config::load(request.root.as_deref(), &request.invocation_cwd) {
        Ok(config) => config,
        Err(error) => {
            // `--help` should work even without a loadable config.
            if request.help {
                render_usage(&Ui::new(0));
                return Ok(0);
            }
            return Err(error);
        }
    };

    let ui = Ui::new(
        config
            .options
            .verbosity
            .saturating_add(request.verbosity_adjustment),
    );

    if request.help {
        render_help(&ui, &config);
        return Ok(0);
    }
    let Some(task_name) = request.task.as_deref() else {
        render_help(&ui, &config);
        return Ok(0);
    };

    match dispatch(&config, &ui, task_name, &request) {
        Err(error) if error.is_usage_error() => {
            render_help(&ui, &config);
            Err(error)
        }
        other => other,
    }
}

fn dispatch(config: &Config, ui: &Ui, task_name: &str, request: &RunRequest) -> PoeResult<i32> {
    if task_name.starts_with('_') {
        return Err(ResolveError::HiddenTask(task_name.to_string()).into());
    }
    let Some(task) = config.lookup(task_name) else {
        return Err(ResolveError::UnknownTask(task_name.to_string()).into());
    };
    log::debug!(
        "Dispatching task '{task_name}' from '{}'",
        config.source.display()
    );

    let mut base_env = EnvVarsManager::from_process(&config.project_dir, &request.invocation_cwd);
    let mut envfiles = EnvFileCache::new();
    for file in &config.options.envfile {
        let path = envfile::resolve_path(file, &base_env, &config.project_dir);
        let entries = envfiles.get(&path, ui)?;
        base_env.apply_file_entries(&entries);
    }
    for (key, value) in &config.options.env {
        base_env.apply(key, value);
    }

    let mut ctx = RunContext::new(
        config,
        ui,
        request.cancel.clone(),
        request.dry_run,
        request.invocation_cwd.clone(),
        base_env,
    );
    ctx.envfiles = envfiles;

    task.run(&mut ctx, &request.args, None, None, false)
}

// MARK: --- HELP ---

fn render_usage(ui: &Ui) {
    ui.output("Poe the Poet (a task runner that works well with pyproject.toml projects)");
    ui.output("");
    ui.output("Usage:");
    ui.output("  poe [global options] <task> [task args]");
    ui.output("");
    ui.output("Global options:");
    ui.output("  -h, --help         Show this help and exit");
    ui.output("  -V, --version      Print the version and exit");
    ui.output("  -v, --verbose      More output (repeatable)");
    ui.output("  -q, --quiet        Less output (repeatable)");
    ui.output("  -d, --dry-run      Print task commands without executing them");
    ui.output("      --root PATH    Config file to use, or directory to search from");
    ui.output("      --ansi         Force colored output");
    ui.output("      --no-ansi      Disable colored output");
    ui.output("");
}

/// The full help: usage plus the configured, non-hidden tasks with their
/// help text and declared arguments.
fn render_help(ui: &Ui, config: &Config) {
    render_usage(ui);

    let visible: Vec<&Task> = config
        .tasks
        .iter()
        .filter(|task| !task.name.starts_with('_'))
        .collect();
    if visible.is_empty() {
        ui.output("No tasks configured.");
        return;
    }

    let width = visible.iter().map(|task| task.name.len()).max().unwrap_or(0);
    ui.output("Configured tasks:");
    for task in visible {
        match &task.opts.help {
            Some(help) => ui.output(&format!("  {:<width$}  {help}", task.name)),
            None => ui.output(&format!("  {}", task.name)),
        }
        for arg in &task.opts.args {
            let label = if arg.positional {
                arg.display.clone()
            } else {
                arg.flags.join(", ")
            };
            let mut line = format!("    {label}");
            if let Some(help) = &arg.help {
                line.push_str("  ");
                line.push_str(help);
            }
            if let Some(default) = &arg.default {
                line.push_str(&format!(" [default: {}]", default.render()));
            }
            ui.output(&line);
        }
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn request(dir: &Path, task: Option<&str>) -> RunRequest {
        RunRequest {
            task: task.map(str::to_string),
            args: Vec::new(),
            root: Some(dir.to_path_buf()),
            invocation_cwd: dir.to_path_buf(),
            dry_run: true,
            help: false,
            verbosity_adjustment: -10,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn project(body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pyproject.toml"), body).unwrap();
        dir
    }

    #[test]
    fn test_no_task_shows_help_and_succeeds() {
        let dir = project("[tool.poe.tasks]\ngreet = \"echo hi\"\n");
        let code = run(request(dir.path(), None)).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_unknown_tasks_are_usage_errors() {
        let dir = project("[tool.poe.tasks]\ngreet = \"echo hi\"\n");
        let err = run(request(dir.path(), Some("nope"))).unwrap_err();
        assert!(err.is_usage_error());
        assert!(err.to_string().contains("Unknown task 'nope'"));
    }

    #[test]
    fn test_hidden_tasks_are_refused_at_the_top_level() {
        let dir = project("[tool.poe.tasks]\n_setup = \"echo hi\"\n");
        let err = run(request(dir.path(), Some("_setup"))).unwrap_err();
        assert!(err.to_string().contains("hidden"));
    }

    #[test]
    fn test_dry_run_reaches_the_task_and_returns_zero() {
        let dir = project("[tool.poe.tasks]\ngreet = \"echo hi\"\n");
        let code = run(request(dir.path(), Some("greet"))).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_help_without_a_config_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), None);
        req.root = Some(dir.path().to_path_buf());
        req.help = true;
        let code = run(req).unwrap();
        assert_eq!(code, 0);
    }
}
