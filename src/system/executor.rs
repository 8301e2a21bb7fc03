//! Child process management: executor selection, `PATH` resolution, and the
//! spawn engine shared by every task kind.
//!
//! The executor decides *which* environment a task runs in (plain, local
//! virtualenv, or poetry-managed virtualenv) and then runs one fully resolved
//! [`Job`]: argv, working directory, layered environment, optional stdin
//! payload, and a capture mode. The wait loop polls the child so a Ctrl+C can
//! interrupt a run without leaving orphans behind.

use crate::CancellationToken;
use crate::constants::{ENV_POE_ACTIVE, INTERRUPT_GRACE_MS};
use crate::core::context::{Invocation, RunContext};
use crate::core::env_manager::EnvVarsManager;
use crate::errors::ExecutionError;
use crate::models::ExecutorSpec;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

// --- Executor selection ---

/// The environment a task's children are spawned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Run with the layered environment as-is.
    Simple,
    /// Run inside a local `./venv` or `./.venv` (or an explicit location).
    Virtualenv,
    /// Run inside the virtualenv that poetry manages for the project.
    Poetry,
}

impl ExecutorKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "simple" => Some(Self::Simple),
            "virtualenv" => Some(Self::Virtualenv),
            "poetry" => Some(Self::Poetry),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Virtualenv => "virtualenv",
            Self::Poetry => "poetry",
        }
    }
}

/// Applies the selected executor's environment adjustments to `env` and
/// returns the kind that was chosen. A task-level `executor` option wins over
/// the global one; with neither set the project is probed: a poetry project
/// with poetry on `PATH` favours the poetry executor, then a local venv, then
/// plain execution.
pub fn prepare(
    ctx: &mut RunContext<'_>,
    env: &mut EnvVarsManager,
    task_spec: Option<&ExecutorSpec>,
) -> Result<ExecutorKind, ExecutionError> {
    let spec = task_spec.or(ctx.config.options.executor.as_ref());
    let kind = match spec.and_then(|s| ExecutorKind::from_name(&s.kind)) {
        Some(kind) => kind,
        None => detect(ctx, env),
    };

    match kind {
        ExecutorKind::Simple => {}
        ExecutorKind::Virtualenv => {
            let venv = match spec.and_then(|s| s.location.as_ref()) {
                Some(location) => {
                    let expanded = shellexpand::tilde(&env.expand(location)).into_owned();
                    let path = ctx.config.project_dir.join(expanded);
                    if !is_venv(&path) {
                        return Err(ExecutionError::VirtualenvMissing { path });
                    }
                    path
                }
                None => venv_dir(&ctx.config.project_dir).ok_or_else(|| {
                    ExecutionError::VirtualenvMissing {
                        path: ctx.config.project_dir.join("venv"),
                    }
                })?,
            };
            apply_venv(env, &venv);
        }
        ExecutorKind::Poetry => match poetry_venv(ctx) {
            Some(venv) => apply_venv(env, &venv),
            None => {
                log::debug!("No poetry environment found; running with the plain environment");
            }
        },
    }

    env.set(ENV_POE_ACTIVE, kind.name());
    log::debug!("Using the {} executor", kind.name());
    Ok(kind)
}

fn detect(ctx: &RunContext<'_>, env: &EnvVarsManager) -> ExecutorKind {
    if ctx.config.has_poetry_project
        && find_executable(&ctx.config.options.poetry_command, env.get("PATH")).is_some()
    {
        return ExecutorKind::Poetry;
    }
    if venv_dir(&ctx.config.project_dir).is_some() {
        return ExecutorKind::Virtualenv;
    }
    ExecutorKind::Simple
}

/// The first conventional virtualenv directory under `project_dir`.
fn venv_dir(project_dir: &Path) -> Option<PathBuf> {
    ["venv", ".venv"]
        .iter()
        .map(|name| project_dir.join(name))
        .find(|dir| is_venv(dir))
}

fn is_venv(dir: &Path) -> bool {
    dir.is_dir() && (dir.join("pyvenv.cfg").is_file() || venv_bin_dir(dir).is_dir())
}

fn venv_bin_dir(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

/// Prepends the virtualenv's bin directory to `PATH` and marks the venv
/// active, mirroring what its `activate` script would do.
fn apply_venv(env: &mut EnvVarsManager, venv: &Path) {
    let bin = venv_bin_dir(venv);
    let joined = match env.get("PATH") {
        Some(current) => {
            let mut paths = vec![bin.clone()];
            paths.extend(std::env::split_paths(current));
            std::env::join_paths(paths)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| bin.to_string_lossy().into_owned())
        }
        None => bin.to_string_lossy().into_owned(),
    };
    env.set("PATH", &joined);
    env.set("VIRTUAL_ENV", &venv.to_string_lossy());
    log::debug!("Activated virtualenv at '{}'", venv.display());
}

/// Locates the poetry-managed virtualenv by shelling out to
/// `poetry env info --path`. The probe result is memoized for the run, so a
/// plan full of poetry tasks pays for it once.
fn poetry_venv(ctx: &mut RunContext<'_>) -> Option<PathBuf> {
    let key = format!(
        "{} env info --path ({})",
        ctx.config.options.poetry_command,
        ctx.config.project_dir.display()
    );
    if let Some(cached) = ctx.exec_cache.get(&key) {
        return (!cached.is_empty()).then(|| PathBuf::from(cached.as_str()));
    }

    log::debug!("Probing '{key}'");
    let output = StdCommand::new(&ctx.config.options.poetry_command)
        .args(["env", "info", "--path"])
        .current_dir(&ctx.config.project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    let discovered = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        Ok(_) => String::new(),
        Err(e) => {
            log::debug!("Poetry probe failed: {e}");
            String::new()
        }
    };

    ctx.exec_cache.insert(key, discovered.clone());
    (!discovered.is_empty()).then(|| PathBuf::from(discovered))
}

// --- PATH resolution ---

/// Searches `path_var` (falling back to the process `PATH`) for an executable
/// called `name`. The child's layered `PATH` must be passed explicitly: the
/// OS would otherwise resolve argv[0] against the runner's own environment,
/// bypassing any activated virtualenv.
pub fn find_executable(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    let search = match path_var {
        Some(value) => value.to_string(),
        None => std::env::var("PATH").ok()?,
    };
    for dir in std::env::split_paths(&search) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        for candidate in executable_names(name) {
            let full = dir.join(candidate);
            if is_executable(&full) {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(windows)]
fn executable_names(name: &str) -> Vec<String> {
    if Path::new(name).extension().is_some() {
        vec![name.to_string()]
    } else {
        vec![
            format!("{name}.exe"),
            format!("{name}.cmd"),
            format!("{name}.bat"),
            name.to_string(),
        ]
    }
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// --- The spawn engine ---

/// What happens to a child's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Flows through to the terminal.
    Inherit,
    /// Stored in the run context under the job's invocation.
    Context,
    /// Redirected to a file.
    File(PathBuf),
}

/// One fully resolved child process, ready to spawn.
#[derive(Debug)]
pub struct Job {
    /// Task name, for error attribution.
    pub task: String,
    /// Invocation identity used to key captured output.
    pub invocation: Invocation,
    pub argv: Vec<String>,
    /// Script payload piped to the child's stdin.
    pub stdin: Option<String>,
    pub cwd: PathBuf,
    pub env: EnvVarsManager,
    pub capture: Capture,
    pub use_exec: bool,
}

/// Renders an argv for display, quoting tokens the way a shell would expect.
pub fn display_argv(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

/// Returns an error when the interrupt flag is set, so plans and sequences
/// can stop between children.
pub fn check_cancelled(cancel: &CancellationToken) -> Result<(), ExecutionError> {
    if cancel.load(Ordering::SeqCst) {
        Err(ExecutionError::Interrupted)
    } else {
        Ok(())
    }
}

/// Runs one job to completion and returns its exit code.
///
/// This function will not return until the child has finished, but it can be
/// interrupted through the context's cancellation token: the child first gets
/// a grace period to react to the terminal's own SIGINT, then it is killed.
pub fn run(ctx: &mut RunContext<'_>, mut job: Job) -> Result<i32, ExecutionError> {
    let Some(program_name) = job.argv.first().cloned() else {
        return Err(ExecutionError::EmptyCommand {
            task: job.task.clone(),
        });
    };
    let display = display_argv(&job.argv);

    if ctx.dry_run {
        log::debug!("Dry run: skipping '{display}'");
        return Ok(0);
    }
    if !job.cwd.is_dir() {
        return Err(ExecutionError::MissingWorkingDir {
            path: job.cwd.clone(),
        });
    }

    // Resolve argv[0] against the layered PATH: the spawned child must see
    // the same world its environment describes.
    let program = if program_name.contains('/') || program_name.contains(std::path::MAIN_SEPARATOR)
    {
        let path = Path::new(&program_name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            job.cwd.join(path)
        }
    } else {
        find_executable(&program_name, job.env.get("PATH")).ok_or_else(|| {
            ExecutionError::ExecutableNotFound {
                program: program_name.clone(),
            }
        })?
    };

    if job.capture == Capture::Context {
        // Keeps Python children from mangling captured text on exotic
        // terminal encodings.
        job.env.set_default("PYTHONIOENCODING", "utf-8");
    }

    #[cfg(unix)]
    if job.use_exec {
        return exec_replace(&job, &program);
    }

    let clean_cwd = dunce::simplified(&job.cwd).to_path_buf();
    let mut command = StdCommand::new(&program);
    command
        .args(&job.argv[1..])
        .current_dir(&clean_cwd)
        .env_clear()
        .envs(job.env.vars())
        .stderr(Stdio::inherit());
    command.stdin(if job.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    match &job.capture {
        Capture::Inherit => {
            command.stdout(Stdio::inherit());
        }
        Capture::Context => {
            command.stdout(Stdio::piped());
        }
        Capture::File(path) => {
            let file = std::fs::File::create(path).map_err(|source| {
                ExecutionError::CaptureRedirect {
                    path: path.clone(),
                    source,
                }
            })?;
            command.stdout(Stdio::from(file));
        }
    }

    log::debug!("Spawning '{display}' in '{}'", clean_cwd.display());
    let spawned = command.spawn().map_err(|source| {
        ExecutionError::CommandFailed {
            command: display.clone(),
            source,
        }
    })?;
    // The child never outlives this call: if anything below bails out early,
    // the guard reaps it.
    let mut child = scopeguard::guard(spawned, |mut child| {
        let _ = child.kill();
        let _ = child.wait();
    });

    // Stdout must be draining before any script is fed in, or a child that
    // fills its output pipe mid-script deadlocks against the stdin write.
    let mut reader = None;
    if job.capture == Capture::Context {
        reader = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                std::io::Read::read_to_end(&mut out, &mut buf).map(|_| buf)
            })
        });
    }

    if let Some(payload) = &job.stdin {
        if let Some(mut handle) = child.stdin.take() {
            use std::io::Write;
            if let Err(e) = handle.write_all(payload.as_bytes()) {
                // A child that exits before reading its script is reported
                // through its exit status, not as a broken pipe.
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(ExecutionError::CommandFailed {
                        command: display.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    // Non-blocking wait loop so cancellation stays responsive.
    let mut kill_after: Option<Instant> = None;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if ctx.cancel.load(Ordering::SeqCst) {
                    match kill_after {
                        None => {
                            log::debug!(
                                "Interrupt received; giving child {} a grace period",
                                child.id()
                            );
                            kill_after =
                                Some(Instant::now() + Duration::from_millis(INTERRUPT_GRACE_MS));
                        }
                        Some(deadline) if Instant::now() >= deadline => {
                            log::debug!("Grace period expired, killing child {}", child.id());
                            if let Err(e) = child.kill() {
                                log::warn!("Failed to kill child process {}: {e}", child.id());
                            }
                            let _ = child.wait();
                            return Err(ExecutionError::Interrupted);
                        }
                        Some(_) => {}
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(source) => {
                return Err(ExecutionError::CommandFailed {
                    command: display.clone(),
                    source,
                });
            }
        }
    };

    if ctx.cancel.load(Ordering::SeqCst) {
        return Err(ExecutionError::Interrupted);
    }

    if let Some(handle) = reader {
        let bytes = handle
            .join()
            .map_err(|_| ExecutionError::CommandFailed {
                command: display.clone(),
                source: std::io::Error::other("the output reader thread panicked"),
            })?
            .map_err(|source| ExecutionError::CommandFailed {
                command: display.clone(),
                source,
            })?;
        // Output is committed only for successful children; a failed upstream
        // aborts the plan before anything downstream could read it.
        if status.success() {
            ctx.save_task_output(&job.invocation, bytes)?;
        }
    }

    Ok(exit_code(&status))
}

/// Replaces the runner process with the child, POSIX `exec` style. Only
/// returns on failure.
#[cfg(unix)]
fn exec_replace(job: &Job, program: &Path) -> Result<i32, ExecutionError> {
    use std::os::unix::process::CommandExt;

    log::debug!("Replacing the current process with '{}'", program.display());
    let mut command = StdCommand::new(program);
    command
        .args(&job.argv[1..])
        .current_dir(dunce::simplified(&job.cwd))
        .env_clear()
        .envs(job.env.vars());
    let source = command.exec();
    Err(ExecutionError::CommandFailed {
        command: display_argv(&job.argv),
        source,
    })
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_kind_names_round_trip() {
        for kind in [
            ExecutorKind::Simple,
            ExecutorKind::Virtualenv,
            ExecutorKind::Poetry,
        ] {
            assert_eq!(ExecutorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ExecutorKind::from_name("conda"), None);
    }

    #[test]
    fn test_display_argv_quotes_whitespace() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(display_argv(&argv), "echo 'hello world'");
    }

    #[cfg(unix)]
    #[test]
    fn test_find_executable_searches_the_given_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        // A plain file without the executable bit must not count.
        std::fs::write(dir.path().join("notes"), "").unwrap();

        let path_var = dir.path().to_string_lossy().into_owned();
        assert_eq!(find_executable("mytool", Some(&path_var)), Some(tool));
        assert_eq!(find_executable("notes", Some(&path_var)), None);
        assert_eq!(find_executable("absent", Some(&path_var)), None);
    }

    #[test]
    fn test_venv_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(venv_dir(dir.path()), None);

        let venv = dir.path().join(".venv");
        std::fs::create_dir(&venv).unwrap();
        assert_eq!(venv_dir(dir.path()), None);

        std::fs::write(venv.join("pyvenv.cfg"), "home = /usr\n").unwrap();
        assert_eq!(venv_dir(dir.path()), Some(venv));
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_venv_prepends_bin_to_path() {
        let mut env = EnvVarsManager::from_map(
            [("PATH".to_string(), "/usr/bin".to_string())].into_iter().collect(),
        );
        let venv = PathBuf::from("/work/.venv");
        apply_venv(&mut env, &venv);

        let path = env.get("PATH").unwrap();
        assert!(path.starts_with("/work/.venv/bin"));
        assert!(path.ends_with("/usr/bin"));
        assert_eq!(env.get("VIRTUAL_ENV"), Some("/work/.venv"));
    }

    #[test]
    fn test_check_cancelled_reflects_the_flag() {
        let token: CancellationToken =
            std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        assert!(check_cancelled(&token).is_ok());
        token.store(true, Ordering::SeqCst);
        assert!(matches!(
            check_cancelled(&token),
            Err(ExecutionError::Interrupted)
        ));
    }
}
