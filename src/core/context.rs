//! Shared state for one `poe` run.

use crate::CancellationToken;
use crate::core::config::Config;
use crate::core::env_manager::EnvVarsManager;
use crate::core::envfile::EnvFileCache;
use crate::errors::ExecutionError;
use crate::ui::Ui;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// One requested task run: the task name plus the extra CLI tokens bound to
/// it. Invocations with the same tuple are the same node in the execution
/// graph, so a task referenced twice with identical args runs once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Invocation {
    pub task: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(task: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            task: task.into(),
            args,
        }
    }

    pub fn bare(task: impl Into<String>) -> Self {
        Self::new(task, Vec::new())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Mutable state threaded through everything a run touches: the loaded
/// config, output helpers, the cancellation flag, and the cross-task caches
/// (captured stdout, parsed envfiles, executor probe results).
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub ui: &'a Ui,
    pub cancel: CancellationToken,
    /// Print what would run instead of spawning anything.
    pub dry_run: bool,
    /// Set for graph runs covering more than one task; makes the runner
    /// print a separator between them.
    pub multistage: bool,
    /// The directory poe was invoked from (`POE_PWD`).
    pub invocation_cwd: PathBuf,
    /// Process env plus the global-level layers, built once per run. Tasks
    /// extend this rather than re-reading the process environment.
    pub base_env: EnvVarsManager,
    pub envfiles: EnvFileCache,
    /// Memoized external probe results keyed by command line, e.g. the
    /// `poetry env info --path` lookup.
    pub exec_cache: HashMap<String, String>,
    captured: HashMap<Invocation, String>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        config: &'a Config,
        ui: &'a Ui,
        cancel: CancellationToken,
        dry_run: bool,
        invocation_cwd: PathBuf,
        base_env: EnvVarsManager,
    ) -> Self {
        Self {
            config,
            ui,
            cancel,
            dry_run,
            multistage: false,
            invocation_cwd,
            base_env,
            envfiles: EnvFileCache::new(),
            exec_cache: HashMap::new(),
            captured: HashMap::new(),
        }
    }

    /// Stores a finished task's captured stdout for downstream `uses`
    /// consumers.
    pub fn save_task_output(
        &mut self,
        invocation: &Invocation,
        bytes: Vec<u8>,
    ) -> Result<(), ExecutionError> {
        let text = String::from_utf8(bytes).map_err(|e| ExecutionError::InvalidUtf8Output {
            command: invocation.to_string(),
            source: e,
        })?;
        log::debug!(
            "Captured {} byte(s) of output from '{invocation}'",
            text.len()
        );
        self.captured.insert(invocation.clone(), text);
        Ok(())
    }

    /// The raw captured stdout of an upstream invocation.
    pub fn task_output(&self, invocation: &Invocation) -> Option<&str> {
        self.captured.get(invocation).map(String::as_str)
    }

    /// Captured stdout normalized for env injection: runs of whitespace
    /// (including newlines) collapse to single spaces.
    pub fn joined_output(&self, invocation: &Invocation) -> Option<String> {
        self.task_output(invocation)
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    pub fn has_task_output(&self, invocation: &Invocation) -> bool {
        self.captured.contains_key(invocation)
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        assert_eq!(Invocation::bare("build").to_string(), "build");
        assert_eq!(
            Invocation::new("test", vec!["-v".to_string(), "fast".to_string()]).to_string(),
            "test -v fast"
        );
    }

    #[test]
    fn test_invocation_identity() {
        let a = Invocation::new("t", vec!["x".to_string()]);
        let b = Invocation::new("t", vec!["x".to_string()]);
        let c = Invocation::bare("t");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
