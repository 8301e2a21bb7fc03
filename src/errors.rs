// src/errors.rs

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the whole crate. Each variant wraps one error
/// domain so the binary can map a failure to an exit code without string
/// matching.
#[derive(Error, Debug)]
pub enum PoeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Arg(#[from] ArgError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

pub type PoeResult<T> = Result<T, PoeError>;

impl PoeError {
    /// True when the run was cut short by Ctrl+C rather than a real failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Interrupted))
    }

    /// Errors caused by what the user typed or configured, for which a usage
    /// hint is worth printing alongside the message.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Validation(_) | Self::Resolve(_) | Self::Arg(_)
        )
    }
}

/// Problems locating, reading, or decoding a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No poe configuration found (searched upward from '{search_root}')")]
    NotFound { search_root: PathBuf },

    #[error("Could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}' as TOML: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("Failed to parse '{path}' as JSON: {source}")]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{path}' has an unsupported config file extension (expected .toml or .json)")]
    UnsupportedFormat { path: PathBuf },

    #[error("Invalid configuration in '{path}': {detail}")]
    Invalid { path: PathBuf, detail: String },

    #[error("Include cycle detected: '{path}' is already being loaded")]
    IncludeCycle { path: PathBuf },
}

/// A structurally sound configuration that breaks one of the task
/// invariants. Always names the offending task.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid task '{task}': {detail}")]
    Task { task: String, detail: String },

    #[error("Invalid configuration option: {detail}")]
    Global { detail: String },
}

/// Failures turning a requested task name into something runnable.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' is hidden and cannot be invoked directly")]
    HiddenTask(String),

    #[error("Cyclic task dependency detected involving task '{task}'")]
    CyclicDependency { task: String },
}

/// Errors from the command-line tokenizer over a task's string content.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unmatched {quote:?} quote at line {line}, column {column}")]
    UnmatchedQuote { quote: char, line: usize, column: usize },

    #[error("Dangling backslash at end of command")]
    TrailingBackslash,

    #[error("Bad substitution at line {line}, column {column}: {detail}")]
    BadSubstitution { line: usize, column: usize, detail: String },

    #[error("A cmd task must contain exactly one command (found {found})")]
    MultipleCommands { found: usize },

    #[error("Invalid glob pattern '{pattern}': {detail}")]
    Glob { pattern: String, detail: String },

    #[error("Invalid expression: {detail}")]
    Expression { detail: String },
}

/// Failures parsing the CLI tokens that follow the task name, relative to a
/// task's declared args.
#[derive(Error, Debug)]
pub enum ArgError {
    #[error("Task '{task}' got an unrecognized argument '{token}'")]
    Unrecognized { task: String, token: String },

    #[error("Option '{flag}' of task '{task}' requires a value")]
    MissingValue { task: String, flag: String },

    #[error("Task '{task}' is missing required argument '{arg}'")]
    MissingRequired { task: String, arg: String },

    #[error("Invalid value '{value}' for argument '{arg}' of task '{task}': expected {expected}")]
    InvalidValue {
        task: String,
        arg: String,
        value: String,
        expected: &'static str,
    },

    #[error("Argument '{arg}' of task '{task}' expects exactly {expected} values (found {found})")]
    WrongCount {
        task: String,
        arg: String,
        expected: usize,
        found: usize,
    },

    #[error("Argument '{arg}' of task '{task}' was given more than once")]
    Duplicate { task: String, arg: String },
}

/// Failures while actually running tasks. A child's non-zero exit code is a
/// result, not an error; these cover everything else.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command '{command}' could not be executed: {source}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Executable '{program}' was not found on PATH")]
    ExecutableNotFound { program: String },

    #[error("Task '{task}' resolved to an empty command")]
    EmptyCommand { task: String },

    #[error("Output of '{command}' was not valid UTF-8")]
    InvalidUtf8Output {
        command: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("Error parsing '{path}' (line {line}, column {column}): {detail}")]
    EnvFile {
        path: PathBuf,
        line: usize,
        column: usize,
        detail: String,
    },

    #[error("Could not read envfile '{path}': {source}")]
    EnvFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task '{task}' failed with exit code {code}")]
    TaskFailed { task: String, code: i32 },

    #[error("Control value '{value}' of task '{task}' did not match any case")]
    SwitchFallthrough { task: String, value: String },

    #[error("No usable interpreter found (tried: {tried})")]
    NoInterpreter { tried: String },

    #[error("Could not find a virtualenv at '{path}'")]
    VirtualenvMissing { path: PathBuf },

    #[error("Could not open '{path}' for stdout redirection: {source}")]
    CaptureRedirect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Working directory '{path}' does not exist")]
    MissingWorkingDir { path: PathBuf },

    #[error("Operation was interrupted by the user.")]
    Interrupted,
}
