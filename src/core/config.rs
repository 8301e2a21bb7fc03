//! # Config Discovery & Loading
//!
//! This module finds the configuration document for the current project,
//! decodes it, folds in any included files, and normalizes the result into a
//! [`Config`]: global options plus the ordered task list, fully validated.
//!
//! Discovery walks upward from the working directory. A `pyproject.toml`
//! only counts when it actually carries a `[tool.poe]` table, so a plain
//! Python project halfway up the tree does not shadow the real config above
//! it. Dedicated `poe_tasks.toml` / `poe_tasks.json` files keep their options
//! at the document root.

use crate::constants::{
    CONFIG_NAMESPACE, DEFAULT_ARRAY_ITEM_TASK_TYPE, DEFAULT_ARRAY_TASK_TYPE, DEFAULT_TASK_TYPE,
    PYPROJECT_FILENAME, TASKS_FILENAME_JSON, TASKS_FILENAME_TOML,
};
use crate::core::tasks::Task;
use crate::errors::{ConfigError, PoeResult, ValidationError};
use crate::models::{ConfigDocument, EnvValue, ExecutorSpec, IncludeSpec};
use crate::system::executor::ExecutorKind;
use crate::system::interpreter;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Global options after defaulting and validation.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub default_task_type: String,
    pub default_array_task_type: String,
    pub default_array_item_task_type: String,
    /// Global env entries, in document order.
    pub env: Vec<(String, EnvValue)>,
    pub envfile: Vec<String>,
    pub executor: Option<ExecutorSpec>,
    pub poetry_command: String,
    /// Poetry hook bindings: hook name to task name, in document order.
    pub poetry_hooks: Vec<(String, String)>,
    pub shell_interpreter: Vec<String>,
    pub verbosity: i64,
}

/// Where a task definition came from, fixed at load time.
#[derive(Debug, Clone)]
pub struct TaskOrigin {
    /// Directory of the document that defined the task (`POE_CONF_DIR`).
    pub conf_dir: PathBuf,
    /// Default working directory imposed by an include entry, used when the
    /// task does not set its own `cwd`.
    pub default_cwd: Option<String>,
}

/// A fully loaded and validated project configuration.
#[derive(Debug)]
pub struct Config {
    /// Directory of the main config file; `POE_ROOT` and the default working
    /// directory for tasks.
    pub project_dir: PathBuf,
    /// The main config file itself.
    pub source: PathBuf,
    pub options: GlobalOptions,
    /// Tasks in definition order, includes already folded in.
    pub tasks: Vec<Task>,
    /// True when the project also carries a `[tool.poetry]` section, which
    /// makes the poetry executor the auto-detection favourite.
    pub has_poetry_project: bool,
}

impl Config {
    pub fn lookup(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    fn validate(&self) -> PoeResult<()> {
        for task in &self.tasks {
            task.validate(self)?;
        }
        for (hook, target) in &self.options.poetry_hooks {
            if self.lookup(target).is_none() {
                return Err(ValidationError::Global {
                    detail: format!(
                        "poetry_hooks entry '{hook}' references unknown task '{target}'"
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

// --- Discovery ---

/// Finds the nearest config file at or above `start_dir`.
pub fn discover(start_dir: &Path) -> Result<PathBuf, ConfigError> {
    let start = dunce::canonicalize(start_dir).map_err(|e| ConfigError::Io {
        path: start_dir.to_path_buf(),
        source: e,
    })?;

    let mut dir = start.clone();
    loop {
        let pyproject = dir.join(PYPROJECT_FILENAME);
        if pyproject.is_file() {
            let doc = read_document(&pyproject)?;
            if lookup_namespace(&doc).is_some() {
                log::debug!("Found config at '{}'", pyproject.display());
                return Ok(pyproject);
            }
            log::debug!(
                "'{}' has no [tool.poe] section; continuing upward",
                pyproject.display()
            );
        }
        for name in [TASKS_FILENAME_TOML, TASKS_FILENAME_JSON] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                log::debug!("Found config at '{}'", candidate.display());
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            return Err(ConfigError::NotFound { search_root: start });
        }
    }
}

/// Resolves which file to load: an explicit `--root` file is taken as-is, an
/// explicit directory starts discovery there, otherwise discovery starts at
/// the invocation cwd.
pub fn load(cli_root: Option<&Path>, invocation_cwd: &Path) -> PoeResult<Config> {
    let source = match cli_root {
        Some(root) if root.is_file() => root.to_path_buf(),
        Some(root) => discover(root)?,
        None => discover(invocation_cwd)?,
    };
    load_file(&source)
}

// --- Loading ---

/// Loads and validates one config file, following its includes.
pub fn load_file(source: &Path) -> PoeResult<Config> {
    let source = dunce::canonicalize(source).map_err(|e| ConfigError::Io {
        path: source.to_path_buf(),
        source: e,
    })?;
    let project_dir = source
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    // --- 1. Decode the main document ---
    let doc_value = read_document(&source)?;
    let table = poe_table(&source, &doc_value)?;
    let mut doc = deserialize_table(&source, table)?;

    let mut origins: HashMap<String, TaskOrigin> = doc
        .tasks
        .keys()
        .map(|name| {
            (
                name.clone(),
                TaskOrigin {
                    conf_dir: project_dir.clone(),
                    default_cwd: None,
                },
            )
        })
        .collect();

    // --- 2. Fold in includes (the base document always wins) ---
    let mut visited = vec![source.clone()];
    if let Some(include) = doc.include.take() {
        merge_includes(&mut doc, &mut origins, &include, &project_dir, &mut visited)?;
    }

    // --- 3. Normalize options and tasks ---
    let options = normalize_options(&doc)?;
    let mut tasks = Vec::with_capacity(doc.tasks.len());
    for (name, value) in &doc.tasks {
        let origin = origins.get(name).cloned().unwrap_or_else(|| TaskOrigin {
            conf_dir: project_dir.clone(),
            default_cwd: None,
        });
        tasks.push(Task::from_def(name, value, &options, origin)?);
    }

    let has_poetry_project = detect_poetry_project(&source, &doc_value, &project_dir);
    let config = Config {
        project_dir,
        source,
        options,
        tasks,
        has_poetry_project,
    };
    config.validate()?;
    log::debug!(
        "Loaded {} task(s) from '{}'",
        config.tasks.len(),
        config.source.display()
    );
    Ok(config)
}

/// Reads a file into a JSON value tree, dispatching on its extension. TOML
/// trees convert losslessly enough for our purposes, with tables keeping
/// their document order.
fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    match path.extension().and_then(OsStr::to_str) {
        Some("toml") => {
            let parsed: toml::Value =
                toml::from_str(&text).map_err(|e| ConfigError::TomlParse {
                    path: path.to_path_buf(),
                    source: Box::new(e),
                })?;
            Ok(toml_to_json(parsed))
        }
        Some("json") => serde_json::from_str(&text).map_err(|e| ConfigError::JsonParse {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_json(value)))
                .collect(),
        ),
    }
}

fn lookup_namespace(doc: &Value) -> Option<&Value> {
    let mut node = doc;
    for key in CONFIG_NAMESPACE {
        node = node.get(key)?;
    }
    Some(node)
}

/// Extracts the options table: `[tool.poe]` for `pyproject.toml`, the whole
/// document for dedicated tasks files.
fn poe_table<'v>(path: &Path, doc: &'v Value) -> Result<&'v Value, ConfigError> {
    let table = if path.file_name().and_then(OsStr::to_str) == Some(PYPROJECT_FILENAME) {
        lookup_namespace(doc).ok_or_else(|| ConfigError::Invalid {
            path: path.to_path_buf(),
            detail: format!("missing [{}] section", CONFIG_NAMESPACE.join(".")),
        })?
    } else {
        doc
    };
    if table.is_object() {
        Ok(table)
    } else {
        Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            detail: "config options must form a table".to_string(),
        })
    }
}

fn deserialize_table(path: &Path, table: &Value) -> Result<ConfigDocument, ConfigError> {
    serde_json::from_value(table.clone()).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

// --- Includes ---

/// Merges included documents into `doc`, depth first, in declaration order.
/// Earlier definitions always win: the base document over its includes, and
/// an earlier include over a later one.
fn merge_includes(
    doc: &mut ConfigDocument,
    origins: &mut HashMap<String, TaskOrigin>,
    include: &IncludeSpec,
    from_dir: &Path,
    visited: &mut Vec<PathBuf>,
) -> PoeResult<()> {
    for (rel_path, default_cwd) in include.entries() {
        let raw_path = from_dir.join(&rel_path);
        let path = dunce::canonicalize(&raw_path).map_err(|_| ConfigError::Invalid {
            path: raw_path,
            detail: "included file does not exist".to_string(),
        })?;
        if visited.contains(&path) {
            return Err(ConfigError::IncludeCycle { path }.into());
        }
        visited.push(path.clone());

        let conf_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let doc_value = read_document(&path)?;
        let table = poe_table(&path, &doc_value)?;
        let mut inc_doc = deserialize_table(&path, table)?;
        log::debug!(
            "Merging include '{}' ({} task(s))",
            path.display(),
            inc_doc.tasks.len()
        );

        for (name, value) in std::mem::take(&mut inc_doc.tasks) {
            if doc.tasks.contains_key(&name) {
                log::trace!("Task '{name}' already defined; include entry ignored");
                continue;
            }
            origins.insert(
                name.clone(),
                TaskOrigin {
                    conf_dir: conf_dir.clone(),
                    default_cwd: default_cwd.clone(),
                },
            );
            doc.tasks.insert(name, value);
        }
        for (key, value) in std::mem::take(&mut inc_doc.env) {
            doc.env.entry(key).or_insert(value);
        }
        for (key, value) in std::mem::take(&mut inc_doc.poetry_hooks) {
            doc.poetry_hooks.entry(key).or_insert(value);
        }
        fill(&mut doc.default_task_type, inc_doc.default_task_type);
        fill(&mut doc.default_array_task_type, inc_doc.default_array_task_type);
        fill(
            &mut doc.default_array_item_task_type,
            inc_doc.default_array_item_task_type,
        );
        fill(&mut doc.envfile, inc_doc.envfile);
        fill(&mut doc.executor, inc_doc.executor);
        fill(&mut doc.poetry_command, inc_doc.poetry_command);
        fill(&mut doc.shell_interpreter, inc_doc.shell_interpreter);
        fill(&mut doc.verbosity, inc_doc.verbosity);

        if let Some(nested) = inc_doc.include.take() {
            merge_includes(doc, origins, &nested, &conf_dir, visited)?;
        }
    }
    Ok(())
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

// --- Normalization ---

fn normalize_options(doc: &ConfigDocument) -> PoeResult<GlobalOptions> {
    let global = |detail: String| ValidationError::Global { detail };

    let default_task_type = doc
        .default_task_type
        .clone()
        .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string());
    if !matches!(default_task_type.as_str(), "cmd" | "shell" | "script" | "expr") {
        return Err(global(format!(
            "default_task_type must be one of cmd, shell, script or expr (got '{default_task_type}')"
        ))
        .into());
    }

    let default_array_task_type = doc
        .default_array_task_type
        .clone()
        .unwrap_or_else(|| DEFAULT_ARRAY_TASK_TYPE.to_string());
    if default_array_task_type != "sequence" {
        return Err(global(format!(
            "default_array_task_type must be sequence (got '{default_array_task_type}')"
        ))
        .into());
    }

    let default_array_item_task_type = doc
        .default_array_item_task_type
        .clone()
        .unwrap_or_else(|| DEFAULT_ARRAY_ITEM_TASK_TYPE.to_string());
    if !matches!(
        default_array_item_task_type.as_str(),
        "cmd" | "ref" | "shell" | "script" | "expr"
    ) {
        return Err(global(format!(
            "default_array_item_task_type must be one of cmd, ref, shell, script or expr (got '{default_array_item_task_type}')"
        ))
        .into());
    }

    let mut env = Vec::with_capacity(doc.env.len());
    for (key, value) in &doc.env {
        let Some(parsed) = EnvValue::from_json(value) else {
            return Err(global(format!(
                "env value for '{key}' must be a string or {{ default = \"...\" }} table"
            ))
            .into());
        };
        env.push((key.clone(), parsed));
    }

    if let Some(spec) = &doc.executor {
        if ExecutorKind::from_name(&spec.kind).is_none() {
            return Err(global(format!(
                "executor type must be one of simple, virtualenv or poetry (got '{}')",
                spec.kind
            ))
            .into());
        }
    }

    let mut poetry_hooks = Vec::with_capacity(doc.poetry_hooks.len());
    for (hook, value) in &doc.poetry_hooks {
        match value {
            Value::String(target) => poetry_hooks.push((hook.clone(), target.clone())),
            _ => {
                return Err(global(format!(
                    "poetry_hooks entry '{hook}' must name a task"
                ))
                .into());
            }
        }
    }

    let shell_interpreter = doc
        .shell_interpreter
        .as_ref()
        .map_or_else(|| vec!["posix".to_string()], crate::models::StringOrList::to_vec);
    for family in &shell_interpreter {
        if !interpreter::is_known_family(family) {
            return Err(global(format!("unsupported shell interpreter '{family}'")).into());
        }
    }

    let verbosity = doc.verbosity.unwrap_or(0);
    if !(-1..=2).contains(&verbosity) {
        return Err(global(format!("verbosity must be between -1 and 2 (got {verbosity})")).into());
    }

    Ok(GlobalOptions {
        default_task_type,
        default_array_task_type,
        default_array_item_task_type,
        env,
        envfile: doc.envfile.as_ref().map(crate::models::StringOrList::to_vec).unwrap_or_default(),
        executor: doc.executor.clone(),
        poetry_command: doc
            .poetry_command
            .clone()
            .unwrap_or_else(|| "poetry".to_string()),
        poetry_hooks,
        shell_interpreter,
        verbosity,
    })
}

/// True when the project declares a `[tool.poetry]` section, either in the
/// loaded `pyproject.toml` itself or in one sitting next to a dedicated
/// tasks file.
fn detect_poetry_project(source: &Path, doc: &Value, project_dir: &Path) -> bool {
    if source.file_name().and_then(OsStr::to_str) == Some(PYPROJECT_FILENAME) {
        return doc.pointer("/tool/poetry").is_some_and(Value::is_object);
    }
    let pyproject = project_dir.join(PYPROJECT_FILENAME);
    pyproject.is_file()
        && read_document(&pyproject)
            .map(|doc| doc.pointer("/tool/poetry").is_some_and(Value::is_object))
            .unwrap_or(false)
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasks::TaskKind;
    use std::fs;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discovery_skips_pyproject_without_namespace() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("pyproject.toml"),
            "[tool.poe.tasks]\nbuild = \"echo up\"\n",
        );
        let nested = dir.path().join("src/deep");
        write(&nested.join("pyproject.toml"), "[project]\nname = \"x\"\n");

        let found = discover(&nested).unwrap();
        assert_eq!(found.parent().unwrap(), dunce::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_discovery_falls_back_to_tasks_file() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("pyproject.toml"), "[project]\nname = \"x\"\n");
        write(
            &dir.path().join("poe_tasks.toml"),
            "[tasks]\ngreet = \"echo hi\"\n",
        );

        let found = discover(dir.path()).unwrap();
        assert_eq!(
            found.file_name().and_then(OsStr::to_str),
            Some(TASKS_FILENAME_TOML)
        );
    }

    #[test]
    fn test_discovery_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(dir.path()),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn test_load_json_tasks_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("poe_tasks.json"),
            r#"{ "tasks": { "greet": "echo hi" } }"#,
        );

        let config = load(None, dir.path()).unwrap();
        assert!(config.lookup("greet").is_some());
        assert_eq!(config.options.default_task_type, "cmd");
        assert_eq!(config.options.poetry_command, "poetry");
        assert_eq!(config.options.shell_interpreter, ["posix"]);
    }

    #[test]
    fn test_missing_namespace_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(&path, "[project]\nname = \"x\"\n");

        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("[tool.poe]"));
    }

    #[test]
    fn test_unknown_global_option_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(&path, "[tool.poe]\nbogus = 1\n[tool.poe.tasks]\n");

        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_task_order_follows_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            "[tool.poe.tasks]\nzeta = \"echo z\"\nalpha = \"echo a\"\nmid = \"echo m\"\n",
        );

        let config = load_file(&path).unwrap();
        let names: Vec<&str> = config.task_names().collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_include_merging_base_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            concat!(
                "[tool.poe]\n",
                "include = \"extra.toml\"\n",
                "env = { SHARED = \"base\" }\n",
                "[tool.poe.tasks]\n",
                "build = \"echo base\"\n",
            ),
        );
        write(
            &dir.path().join("extra.toml"),
            concat!(
                "env = { SHARED = \"include\", ONLY = \"include\" }\n",
                "[tasks]\n",
                "build = \"echo include\"\n",
                "deploy = \"echo deploy\"\n",
            ),
        );

        let config = load_file(&path).unwrap();
        assert!(config.lookup("deploy").is_some());
        match &config.lookup("build").unwrap().kind {
            TaskKind::Cmd { cmd } => assert!(cmd.contains("base")),
            other => panic!("unexpected kind {other:?}"),
        }
        let shared = config
            .options
            .env
            .iter()
            .find(|(key, _)| key == "SHARED")
            .unwrap();
        assert_eq!(shared.1, EnvValue::Literal("base".to_string()));
        assert!(config.options.env.iter().any(|(key, _)| key == "ONLY"));
    }

    #[test]
    fn test_include_sets_cwd_and_conf_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            concat!(
                "[tool.poe]\n",
                "include = [{ path = \"sub/extra.toml\", cwd = \"sub\" }]\n",
                "[tool.poe.tasks]\n",
            ),
        );
        write(
            &dir.path().join("sub/extra.toml"),
            "[tasks]\ngreet = \"echo hi\"\n",
        );

        let config = load_file(&path).unwrap();
        let greet = config.lookup("greet").unwrap();
        assert_eq!(greet.opts.cwd.as_deref(), Some("sub"));
        assert_eq!(
            greet.opts.conf_dir,
            dunce::canonicalize(dir.path().join("sub")).unwrap()
        );
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            "[tool.poe]\ninclude = \"extra.toml\"\n[tool.poe.tasks]\n",
        );
        write(
            &dir.path().join("extra.toml"),
            "include = \"pyproject.toml\"\n[tasks]\n",
        );

        let err = load_file(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::errors::PoeError::Config(ConfigError::IncludeCycle { .. })
        ));
    }

    #[test]
    fn test_poetry_hooks_must_reference_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            "[tool.poe]\npoetry_hooks = { pre_build = \"nope\" }\n[tool.poe.tasks]\n",
        );

        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_poetry_project_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        write(
            &path,
            concat!(
                "[tool.poetry]\nname = \"demo\"\n",
                "[tool.poe.tasks]\ngreet = \"echo hi\"\n",
            ),
        );

        let config = load_file(&path).unwrap();
        assert!(config.has_poetry_project);
    }
}
