//! The task model. A `Task` is one named unit of work from the config: its
//! content (one of the seven variants), its common options, and where it was
//! defined. Normalization from the raw document, static validation, and the
//! uniform run contract all live here; spawning is `system::executor`'s job
//! and plan ordering is `core::graph`'s.

use crate::constants::{ENV_POE_CONF_DIR, SWITCH_DEFAULT_CASE};
use crate::core::args::{self, ArgDef, ArgValue, ParsedArgs};
use crate::core::command_parser;
use crate::core::config::{Config, GlobalOptions, TaskOrigin};
use crate::core::context::{Invocation, RunContext};
use crate::core::env_manager::EnvVarsManager;
use crate::core::envfile;
use crate::core::graph::ExecutionGraph;
use crate::core::template;
use crate::errors::{ArgError, ExecutionError, PoeResult, ResolveError, ValidationError};
use crate::models::{
    AssertSpec, CaptureSpec, EnvValue, ExecutorSpec, IgnoreFailSpec, StringOrList, TaskTable,
};
use crate::system::executor::{self, Capture, ExecutorKind, Job};
use crate::system::interpreter;
use crate::ui::ActionStyle;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};

lazy_static! {
    /// Task names start with a non-digit word character; the rest may add
    /// digits, `-`, `+` and `:`.
    static ref TASK_NAME_RE: Regex = Regex::new(r"^[^\d\W][\w\-\+\:]*$").unwrap();
}

/// The seven content keys, also naming the task variants.
const CONTENT_KEYS: &[&str] = &["cmd", "shell", "script", "expr", "ref", "sequence", "switch"];

/// Options every variant accepts.
const COMMON_KEYS: &[&str] = &[
    "args",
    "capture_stdout",
    "cwd",
    "deps",
    "env",
    "envfile",
    "executor",
    "help",
    "uses",
];

/// Extra options each variant accepts on top of [`COMMON_KEYS`].
fn variant_keys(content: &str) -> &'static [&'static str] {
    match content {
        "cmd" => &["use_exec"],
        "shell" => &["interpreter"],
        "script" => &["use_exec", "print_result"],
        "expr" => &["imports", "assert", "use_exec"],
        "sequence" => &["ignore_fail", "default_item_type"],
        "switch" => &["control", "default"],
        _ => &[],
    }
}

// MARK: --- MODEL ---

/// What a sequence does when an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreFail {
    /// Stop at the first failure and return its exit code.
    Abort,
    /// Run everything and return 0 regardless.
    Ignore,
    /// Run everything, then return the first non-zero exit code.
    ReturnNonZero,
}

/// What a switch does when no case matches the control value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMiss {
    Pass,
    Fail,
}

/// One branch of a switch: the values it matches (the default case matches
/// [`SWITCH_DEFAULT_CASE`]) and the task it runs.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub values: Vec<String>,
    pub task: Task,
}

/// The task content, tagged by which content key the document used.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Cmd {
        cmd: String,
    },
    Shell {
        shell: String,
        /// Interpreter family preference; falls back to the global
        /// `shell_interpreter` option.
        interpreter: Option<Vec<String>>,
    },
    Script {
        script: String,
        print_result: bool,
    },
    Expr {
        expr: String,
        imports: Vec<String>,
        assertion: Option<AssertSpec>,
    },
    Ref {
        target: String,
    },
    Sequence {
        items: Vec<Task>,
        ignore_fail: IgnoreFail,
    },
    Switch {
        control: Box<Task>,
        cases: Vec<SwitchCase>,
        on_miss: CaseMiss,
    },
}

/// Common options after normalization. `env` and `uses` keep document order.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub args: Vec<ArgDef>,
    pub capture_stdout: Option<CaptureSpec>,
    pub cwd: Option<String>,
    pub deps: Vec<String>,
    pub env: Vec<(String, EnvValue)>,
    pub envfile: Vec<String>,
    pub executor: Option<ExecutorSpec>,
    pub help: Option<String>,
    pub uses: Vec<(String, String)>,
    pub use_exec: bool,
    /// Directory of the document that defined this task (`POE_CONF_DIR`).
    pub conf_dir: PathBuf,
}

impl TaskOptions {
    /// Options for the string and array task forms, which carry nothing of
    /// their own beyond what the include origin imposes.
    fn bare(origin: &TaskOrigin) -> Self {
        Self {
            args: Vec::new(),
            capture_stdout: None,
            cwd: origin.default_cwd.clone(),
            deps: Vec::new(),
            env: Vec::new(),
            envfile: Vec::new(),
            executor: None,
            help: None,
            uses: Vec::new(),
            use_exec: false,
            conf_dir: origin.conf_dir.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    pub opts: TaskOptions,
}

// MARK: --- NORMALIZATION ---

impl Task {
    /// Builds a task from its raw document value, accepting the three
    /// definition shapes: a string (typed by `default_task_type`), an array
    /// (a sequence), or a table with exactly one content key.
    pub fn from_def(
        name: &str,
        value: &Value,
        options: &GlobalOptions,
        origin: TaskOrigin,
    ) -> PoeResult<Self> {
        if !TASK_NAME_RE.is_match(name) {
            return Err(ValidationError::Task {
                task: name.to_string(),
                detail: "task names must start with a letter or '_' and contain only \
                         letters, digits, '-', '_', '+' and ':'"
                    .to_string(),
            }
            .into());
        }
        Self::normalize(name, value, options, &origin, &options.default_task_type)
    }

    /// Normalizes one definition value. `string_type` decides the variant a
    /// bare string maps to; it differs between top-level tasks and sequence
    /// items.
    fn normalize(
        name: &str,
        value: &Value,
        options: &GlobalOptions,
        origin: &TaskOrigin,
        string_type: &str,
    ) -> PoeResult<Self> {
        match value {
            Value::String(content) => Ok(Self {
                name: name.to_string(),
                kind: leaf_kind(string_type, content.clone()),
                opts: TaskOptions::bare(origin),
            }),
            Value::Array(items) => {
                let kind = Self::sequence_kind(name, items, None, None, options, origin)?;
                Ok(Self {
                    name: name.to_string(),
                    kind,
                    opts: TaskOptions::bare(origin),
                })
            }
            Value::Object(table) => Self::from_table(name, table, options, origin),
            _ => Err(ValidationError::Task {
                task: name.to_string(),
                detail: "a task must be a string, an array or a table".to_string(),
            }
            .into()),
        }
    }

    /// Normalizes a table definition: enforce the content-key and option-key
    /// rules against the raw keys, then deserialize and build the variant.
    fn from_table(
        name: &str,
        table: &Map<String, Value>,
        options: &GlobalOptions,
        origin: &TaskOrigin,
    ) -> PoeResult<Self> {
        let invalid = |detail: String| ValidationError::Task {
            task: name.to_string(),
            detail,
        };

        let present: Vec<&str> = CONTENT_KEYS
            .iter()
            .copied()
            .filter(|key| table.contains_key(*key))
            .collect();
        let content = match present.as_slice() {
            [one] => *one,
            [] => {
                return Err(invalid(format!(
                    "a task table must set exactly one of: {}",
                    CONTENT_KEYS.join(", ")
                ))
                .into());
            }
            many => {
                return Err(invalid(format!("conflicting content keys: {}", many.join(", "))).into());
            }
        };

        let extras = variant_keys(content);
        for key in table.keys() {
            if key != content
                && !COMMON_KEYS.contains(&key.as_str())
                && !extras.contains(&key.as_str())
            {
                return Err(invalid(format!("unknown option '{key}' for a {content} task")).into());
            }
        }

        let parsed: TaskTable = serde_json::from_value(Value::Object(table.clone()))
            .map_err(|e| invalid(e.to_string()))?;

        let kind = match content {
            "cmd" => TaskKind::Cmd {
                cmd: parsed.cmd.clone().unwrap_or_default(),
            },
            "shell" => {
                let families = parsed.interpreter.as_ref().map(StringOrList::to_vec);
                if let Some(families) = &families {
                    for family in families {
                        if !interpreter::is_known_family(family) {
                            return Err(
                                invalid(format!("unknown interpreter '{family}'")).into()
                            );
                        }
                    }
                }
                TaskKind::Shell {
                    shell: parsed.shell.clone().unwrap_or_default(),
                    interpreter: families,
                }
            }
            "script" => TaskKind::Script {
                script: parsed.script.clone().unwrap_or_default(),
                print_result: parsed.print_result.unwrap_or(false),
            },
            "expr" => TaskKind::Expr {
                expr: parsed.expr.clone().unwrap_or_default(),
                imports: parsed.imports.clone().unwrap_or_default(),
                assertion: parsed.assertion.clone(),
            },
            "ref" => TaskKind::Ref {
                target: parsed.reference.clone().unwrap_or_default(),
            },
            "sequence" => {
                let items = parsed.sequence.as_deref().unwrap_or(&[]);
                Self::sequence_kind(
                    name,
                    items,
                    parsed.default_item_type.as_deref(),
                    parsed.ignore_fail.as_ref(),
                    options,
                    origin,
                )?
            }
            "switch" => Self::switch_kind(name, &parsed, options, origin)?,
            other => return Err(invalid(format!("unsupported content key '{other}'")).into()),
        };

        let mut env = Vec::with_capacity(parsed.env.len());
        for (key, value) in &parsed.env {
            let Some(env_value) = EnvValue::from_json(value) else {
                return Err(invalid(format!(
                    "env value for '{key}' must be a string or a {{ default = \"...\" }} table"
                ))
                .into());
            };
            env.push((key.clone(), env_value));
        }

        let mut uses = Vec::with_capacity(parsed.uses.len());
        for (key, value) in &parsed.uses {
            if !template::is_valid_identifier(key) {
                return Err(invalid(format!(
                    "uses key '{key}' is not a valid environment variable name"
                ))
                .into());
            }
            match value {
                Value::String(entry) => uses.push((key.clone(), entry.clone())),
                _ => {
                    return Err(
                        invalid(format!("uses entry '{key}' must name a task invocation")).into(),
                    );
                }
            }
        }

        if let Some(spec) = &parsed.executor {
            if ExecutorKind::from_name(&spec.kind).is_none() {
                return Err(invalid(format!(
                    "unknown executor type '{}' (expected simple, virtualenv or poetry)",
                    spec.kind
                ))
                .into());
            }
        }

        let task_args = match &parsed.args {
            Some(spec) => args::normalize_args(name, spec)?,
            None => Vec::new(),
        };

        // A cwd imposed by an include entry anchors the task's own relative
        // cwd; absent a task cwd it applies as-is.
        let cwd = match (parsed.cwd.clone(), origin.default_cwd.clone()) {
            (Some(own), Some(base)) if !Path::new(&own).is_absolute() => Some(
                Path::new(&base)
                    .join(own)
                    .to_string_lossy()
                    .into_owned(),
            ),
            (Some(own), _) => Some(own),
            (None, inherited) => inherited,
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            opts: TaskOptions {
                args: task_args,
                capture_stdout: parsed.capture_stdout.clone(),
                cwd,
                deps: parsed.deps.clone().unwrap_or_default(),
                env,
                envfile: parsed
                    .envfile
                    .as_ref()
                    .map(StringOrList::to_vec)
                    .unwrap_or_default(),
                executor: parsed.executor.clone(),
                help: parsed.help.clone(),
                uses,
                use_exec: parsed.use_exec.unwrap_or(false),
                conf_dir: origin.conf_dir.clone(),
            },
        })
    }

    /// Builds a sequence variant from its item list. Items are named
    /// `parent[index]` and cannot declare their own CLI args.
    fn sequence_kind(
        name: &str,
        items: &[Value],
        item_type: Option<&str>,
        ignore_fail: Option<&IgnoreFailSpec>,
        options: &GlobalOptions,
        origin: &TaskOrigin,
    ) -> PoeResult<TaskKind> {
        let invalid = |detail: String| ValidationError::Task {
            task: name.to_string(),
            detail,
        };

        let item_type = match item_type {
            Some(t) => {
                if !matches!(t, "cmd" | "ref" | "shell" | "script" | "expr") {
                    return Err(invalid(format!(
                        "default_item_type must be one of cmd, ref, shell, script or expr \
                         (got '{t}')"
                    ))
                    .into());
                }
                t.to_string()
            }
            None => options.default_array_item_task_type.clone(),
        };

        let mut tasks = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let item_name = format!("{name}[{index}]");
            if matches!(item, Value::Array(_)) {
                return Err(invalid(format!(
                    "sequence item {index} must be a string or a task table"
                ))
                .into());
            }
            let task = Self::normalize(&item_name, item, options, origin, &item_type)?;
            if !task.opts.args.is_empty() {
                return Err(ValidationError::Task {
                    task: item_name,
                    detail: "sequence items cannot declare args".to_string(),
                }
                .into());
            }
            tasks.push(task);
        }

        let ignore_fail = match ignore_fail {
            None | Some(IgnoreFailSpec::Flag(false)) => IgnoreFail::Abort,
            Some(IgnoreFailSpec::Flag(true)) => IgnoreFail::Ignore,
            Some(IgnoreFailSpec::Mode(mode)) if mode == "return_non_zero" => {
                IgnoreFail::ReturnNonZero
            }
            Some(IgnoreFailSpec::Mode(mode)) => {
                return Err(invalid(format!(
                    "ignore_fail must be a boolean or \"return_non_zero\" (got '{mode}')"
                ))
                .into());
            }
        };

        Ok(TaskKind::Sequence {
            items: tasks,
            ignore_fail,
        })
    }

    /// Builds a switch variant: a control task plus case branches, each
    /// matching one or more control values. At most one default case.
    fn switch_kind(
        name: &str,
        parsed: &TaskTable,
        options: &GlobalOptions,
        origin: &TaskOrigin,
    ) -> PoeResult<TaskKind> {
        let invalid = |detail: String| ValidationError::Task {
            task: name.to_string(),
            detail,
        };

        let Some(control_value) = &parsed.control else {
            return Err(invalid("a switch task requires a control task".to_string()).into());
        };
        let control = Self::normalize(
            &format!("{name}[control]"),
            control_value,
            options,
            origin,
            &options.default_task_type,
        )?;
        if !matches!(
            control.kind,
            TaskKind::Cmd { .. } | TaskKind::Script { .. } | TaskKind::Expr { .. }
        ) {
            return Err(invalid(
                "the control of a switch must be a cmd, script or expr task".to_string(),
            )
            .into());
        }
        if control.opts.capture_stdout.is_some() {
            return Err(invalid(
                "the control of a switch cannot set capture_stdout".to_string(),
            )
            .into());
        }
        if control.opts.use_exec {
            return Err(invalid(
                "the control of a switch cannot set use_exec".to_string(),
            )
            .into());
        }
        if !control.opts.args.is_empty() {
            return Err(invalid("the control of a switch cannot declare args".to_string()).into());
        }

        let entries = parsed.switch.as_deref().unwrap_or(&[]);
        if entries.is_empty() {
            return Err(invalid("a switch task requires at least one case".to_string()).into());
        }

        let mut cases = Vec::with_capacity(entries.len());
        let mut seen: Vec<String> = Vec::new();
        let mut default_seen = false;
        for (index, entry) in entries.iter().enumerate() {
            let Value::Object(entry_table) = entry else {
                return Err(invalid(format!("switch case {index} must be a task table")).into());
            };
            let mut table = entry_table.clone();
            let values = match table.remove("case") {
                None => vec![SWITCH_DEFAULT_CASE.to_string()],
                Some(Value::String(value)) => vec![value],
                Some(Value::Array(list)) => {
                    let mut values = Vec::with_capacity(list.len());
                    for value in list {
                        match value {
                            Value::String(s) => values.push(s),
                            _ => {
                                return Err(invalid(format!(
                                    "switch case {index} values must be strings"
                                ))
                                .into());
                            }
                        }
                    }
                    if values.is_empty() {
                        return Err(
                            invalid(format!("switch case {index} lists no values")).into()
                        );
                    }
                    values
                }
                Some(_) => {
                    return Err(invalid(format!(
                        "switch case {index} must be a string or a list of strings"
                    ))
                    .into());
                }
            };
            for value in &values {
                if value == SWITCH_DEFAULT_CASE {
                    if default_seen {
                        return Err(invalid(
                            "a switch may declare at most one default case".to_string(),
                        )
                        .into());
                    }
                    default_seen = true;
                } else if seen.contains(value) {
                    return Err(invalid(format!("duplicated case value '{value}'")).into());
                } else {
                    seen.push(value.clone());
                }
            }

            let task = Self::from_table(&format!("{name}[{index}]"), &table, options, origin)?;
            if !task.opts.args.is_empty() {
                return Err(ValidationError::Task {
                    task: task.name,
                    detail: "switch cases cannot declare args".to_string(),
                }
                .into());
            }
            cases.push(SwitchCase { values, task });
        }

        let on_miss = match parsed.default.as_deref() {
            None | Some("fail") => CaseMiss::Fail,
            Some("pass") => CaseMiss::Pass,
            Some(other) => {
                return Err(invalid(format!(
                    "switch default must be \"pass\" or \"fail\" (got '{other}')"
                ))
                .into());
            }
        };

        Ok(TaskKind::Switch {
            control: Box::new(control),
            cases,
            on_miss,
        })
    }
}

/// The variant a bare string maps to under the given default type. The type
/// itself is validated where it is configured.
fn leaf_kind(task_type: &str, content: String) -> TaskKind {
    match task_type {
        "shell" => TaskKind::Shell {
            shell: content,
            interpreter: None,
        },
        "script" => TaskKind::Script {
            script: content,
            print_result: false,
        },
        "expr" => TaskKind::Expr {
            expr: content,
            imports: Vec::new(),
            assertion: None,
        },
        "ref" => TaskKind::Ref { target: content },
        _ => TaskKind::Cmd { cmd: content },
    }
}

// MARK: --- VALIDATION ---

impl Task {
    /// Static checks against the fully loaded config, run once at load time
    /// before anything executes.
    pub fn validate(&self, config: &Config) -> PoeResult<()> {
        let invalid = |detail: String| ValidationError::Task {
            task: self.name.clone(),
            detail,
        };

        if self.opts.use_exec {
            if self.opts.capture_stdout.is_some() {
                return Err(
                    invalid("use_exec cannot be combined with capture_stdout".to_string()).into(),
                );
            }
            if !matches!(
                self.kind,
                TaskKind::Cmd { .. } | TaskKind::Script { .. } | TaskKind::Expr { .. }
            ) {
                return Err(invalid(
                    "use_exec is only supported on cmd, script and expr tasks".to_string(),
                )
                .into());
            }
        }

        for entry in &self.opts.deps {
            self.check_reference(config, entry, "deps")?;
        }
        for (key, entry) in &self.opts.uses {
            if let Some(target) = self.check_reference(config, entry, "uses")? {
                if target.opts.use_exec {
                    return Err(invalid(format!(
                        "uses entry '{key}' references task '{}', which sets use_exec",
                        target.name
                    ))
                    .into());
                }
                if target.opts.capture_stdout.is_some() {
                    return Err(invalid(format!(
                        "uses entry '{key}' references task '{}', which already captures \
                         its stdout",
                        target.name
                    ))
                    .into());
                }
                if matches!(target.kind, TaskKind::Sequence { .. }) {
                    return Err(invalid(format!(
                        "uses entry '{key}' references sequence task '{}', whose output \
                         cannot be captured",
                        target.name
                    ))
                    .into());
                }
            }
        }

        // Template-free cwd values are checked here; templated ones get the
        // same containment check at runtime once expanded.
        if let Some(cwd) = &self.opts.cwd {
            if !cwd.contains('$') {
                let resolved = normalize_path(&config.project_dir.join(cwd));
                if !resolved.starts_with(&config.project_dir) {
                    return Err(invalid(format!(
                        "cwd '{cwd}' resolves outside the project directory"
                    ))
                    .into());
                }
            }
        }

        match &self.kind {
            TaskKind::Cmd { .. } | TaskKind::Shell { .. } => {}
            TaskKind::Script { script, .. } => {
                interpreter::parse_script_reference(&self.name, script)?;
            }
            TaskKind::Expr { expr, .. } => {
                interpreter::validate_expression(expr)?;
            }
            TaskKind::Ref { target } => {
                if let Some(target_task) = self.check_reference(config, target, "ref")? {
                    if target_task.opts.use_exec {
                        return Err(invalid(format!(
                            "ref target '{}' sets use_exec",
                            target_task.name
                        ))
                        .into());
                    }
                }
            }
            TaskKind::Sequence { items, .. } => {
                if self.opts.capture_stdout.is_some() {
                    return Err(invalid(
                        "capture_stdout cannot be used on a sequence task".to_string(),
                    )
                    .into());
                }
                for item in items {
                    item.validate(config)?;
                }
            }
            TaskKind::Switch { control, cases, .. } => {
                if self.opts.capture_stdout.is_some() {
                    return Err(invalid(
                        "capture_stdout cannot be used on a switch task".to_string(),
                    )
                    .into());
                }
                control.validate(config)?;
                for case in cases {
                    case.task.validate(config)?;
                }
            }
        }
        Ok(())
    }

    /// Checks one invocation entry: it must split into tokens, and when the
    /// target name is template-free it must exist in the config.
    fn check_reference<'c>(
        &self,
        config: &'c Config,
        entry: &str,
        option: &str,
    ) -> PoeResult<Option<&'c Task>> {
        let invalid = |detail: String| ValidationError::Task {
            task: self.name.clone(),
            detail,
        };
        let Some(tokens) = shlex::split(entry) else {
            return Err(
                invalid(format!("{option} entry '{entry}' is not a valid invocation")).into(),
            );
        };
        let Some(target) = tokens.first() else {
            return Err(invalid(format!("{option} entry is empty")).into());
        };
        if target.contains('$') {
            // The target name is decided at runtime.
            return Ok(None);
        }
        match config.lookup(target) {
            Some(task) => Ok(Some(task)),
            None => {
                Err(invalid(format!("{option} entry references unknown task '{target}'")).into())
            }
        }
    }
}

/// Lexically resolves `.` and `..` components without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// MARK: --- EXECUTION ---

impl Task {
    pub fn has_upstream(&self) -> bool {
        !self.opts.deps.is_empty() || !self.opts.uses.is_empty()
    }

    /// The task's direct upstream work as invocation tuples: `deps` first,
    /// then `uses` values, both in declaration order.
    pub(crate) fn upstream(
        &self,
        env: &EnvVarsManager,
    ) -> PoeResult<(Vec<Invocation>, Vec<(String, Invocation)>)> {
        let mut deps = Vec::with_capacity(self.opts.deps.len());
        for entry in &self.opts.deps {
            deps.push(self.parse_invocation(entry, env)?);
        }
        let mut uses = Vec::with_capacity(self.opts.uses.len());
        for (key, entry) in &self.opts.uses {
            uses.push((key.clone(), self.parse_invocation(entry, env)?));
        }
        Ok((deps, uses))
    }

    /// Expands and splits one invocation entry into its task name and args.
    fn parse_invocation(&self, entry: &str, env: &EnvVarsManager) -> PoeResult<Invocation> {
        let expanded = env.expand(entry);
        let tokens = shlex::split(&expanded).unwrap_or_default();
        let Some((target, rest)) = tokens.split_first() else {
            return Err(ValidationError::Task {
                task: self.name.clone(),
                detail: format!("invocation '{entry}' resolves to nothing"),
            }
            .into());
        };
        Ok(Invocation::new(target.clone(), rest.to_vec()))
    }

    /// How the task reads in sequence and failure messages: anonymous ref
    /// items go by their target's name.
    fn label(&self) -> String {
        match &self.kind {
            TaskKind::Ref { target } => target
                .split_whitespace()
                .next()
                .unwrap_or(self.name.as_str())
                .to_string(),
            _ => self.name.clone(),
        }
    }

    /// Runs this task as the sink of its own plan. When upstream work exists
    /// the execution graph orders and runs it first; otherwise the body runs
    /// directly.
    ///
    /// `parent_env` layers the caller's environment under this task's own
    /// (None means the run context's base). `capture` forces stdout into the
    /// run context, as when the task is a `uses` target.
    pub fn run(
        &self,
        ctx: &mut RunContext<'_>,
        extra_args: &[String],
        parent_env: Option<&EnvVarsManager>,
        default_cwd: Option<&Path>,
        capture: bool,
    ) -> PoeResult<i32> {
        if self.has_upstream() {
            let plan = ExecutionGraph::build(ctx, self, extra_args, capture)?;
            plan.execute(ctx, self, extra_args, parent_env, default_cwd)
        } else {
            self.run_body(ctx, extra_args, parent_env, default_cwd, capture)
        }
    }

    /// Runs the task body itself, assuming any upstream work already ran and
    /// left its outputs in the context.
    pub(crate) fn run_body(
        &self,
        ctx: &mut RunContext<'_>,
        extra_args: &[String],
        parent_env: Option<&EnvVarsManager>,
        default_cwd: Option<&Path>,
        capture: bool,
    ) -> PoeResult<i32> {
        executor::check_cancelled(&ctx.cancel)?;
        log::debug!("Running task '{}'", self.name);

        // Layer the environment: parent (or base), this task's envfiles,
        // its env table, captured upstream outputs, then named-arg bindings.
        let mut env = match parent_env {
            Some(parent) => parent.extended(),
            None => ctx.base_env.extended(),
        };
        env.set(ENV_POE_CONF_DIR, &self.opts.conf_dir.to_string_lossy());
        for file in &self.opts.envfile {
            let path = envfile::resolve_path(file, &env, &ctx.config.project_dir);
            let entries = ctx.envfiles.get(&path, ctx.ui)?;
            env.apply_file_entries(&entries);
        }
        for (key, value) in &self.opts.env {
            env.apply(key, value);
        }

        let (_, uses) = self.upstream(&ctx.base_env)?;
        let mut unresolved = false;
        for (key, invocation) in &uses {
            match ctx.joined_output(invocation) {
                Some(value) => env.set(key, &value),
                None => unresolved = true,
            }
        }

        let parsed = args::parse_args(&self.name, &self.opts.args, extra_args, env.vars())?;
        for (key, value) in parsed.env_bindings() {
            env.set(key, &value);
        }

        let cwd = self.working_dir(ctx, &env, default_cwd)?;
        let cap_mode = self.capture_mode(capture, &env, &cwd);
        ctx.ui.debug(&format!(
            "Task '{}' runs in '{}' with {} env var(s)",
            self.name,
            cwd.display(),
            env.vars().len()
        ));

        match &self.kind {
            TaskKind::Cmd { cmd } => {
                executor::prepare(ctx, &mut env, self.opts.executor.as_ref())?;
                let mut argv = command_parser::resolve_command(cmd, env.vars(), &cwd)?;
                argv.extend(parsed.passthrough().iter().cloned());
                if argv.is_empty() {
                    return Err(ExecutionError::EmptyCommand {
                        task: self.name.clone(),
                    }
                    .into());
                }
                self.announce(ctx, &cap_mode, unresolved, &executor::display_argv(&argv));
                self.spawn(ctx, argv, None, cwd, env, cap_mode, extra_args, self.opts.use_exec)
            }
            TaskKind::Shell {
                shell,
                interpreter: families,
            } => {
                self.reject_passthrough(&parsed)?;
                executor::prepare(ctx, &mut env, self.opts.executor.as_ref())?;
                let preference = families
                    .clone()
                    .unwrap_or_else(|| ctx.config.options.shell_interpreter.clone());
                let (program, flags) = interpreter::resolve(&preference, env.get("PATH"))?;
                let content = interpreter::unindent(shell);
                self.announce(ctx, &cap_mode, unresolved, content.trim());
                let mut argv = vec![program];
                argv.extend(flags);
                self.spawn(ctx, argv, Some(content), cwd, env, cap_mode, extra_args, false)
            }
            TaskKind::Script {
                script,
                print_result,
            } => {
                self.reject_passthrough(&parsed)?;
                executor::prepare(ctx, &mut env, self.opts.executor.as_ref())?;
                let spec = interpreter::parse_script_reference(&self.name, script)?;
                let bindings = self.arg_bindings(&parsed);
                let payload = interpreter::script_bootstrap(&spec, &bindings, *print_result);
                let python = interpreter::find_python(env.get("PATH"))?;
                self.announce(ctx, &cap_mode, unresolved, script);
                let argv = vec![python, "-c".to_string(), payload];
                self.spawn(ctx, argv, None, cwd, env, cap_mode, extra_args, self.opts.use_exec)
            }
            TaskKind::Expr {
                expr,
                imports,
                assertion,
            } => {
                self.reject_passthrough(&parsed)?;
                executor::prepare(ctx, &mut env, self.opts.executor.as_ref())?;
                let source = env.expand(expr);
                // Expansion happens before Python sees the text, so the
                // expanded form must still parse as a single expression.
                interpreter::validate_expression(&source)?;
                let bindings = self.arg_bindings(&parsed);
                let payload =
                    interpreter::expr_bootstrap(&source, imports, &bindings, assertion.as_ref());
                let python = interpreter::find_python(env.get("PATH"))?;
                self.announce(ctx, &cap_mode, unresolved, &source);
                let argv = vec![python, "-c".to_string(), payload];
                self.spawn(ctx, argv, None, cwd, env, cap_mode, extra_args, self.opts.use_exec)
            }
            TaskKind::Ref { target } => {
                let invocation = self.parse_invocation(target, &env)?;
                let config = ctx.config;
                let Some(target_task) = config.lookup(&invocation.task) else {
                    return Err(ResolveError::UnknownTask(invocation.task.clone()).into());
                };
                let mut forwarded = invocation.args.clone();
                forwarded.extend(parsed.passthrough().iter().cloned());
                let code = target_task.run(ctx, &forwarded, Some(&env), Some(&cwd), capture)?;
                if capture && code == 0 {
                    let stored = Invocation::new(invocation.task.clone(), forwarded);
                    self.alias_capture(ctx, &stored, extra_args)?;
                }
                Ok(code)
            }
            TaskKind::Sequence { items, ignore_fail } => {
                if capture {
                    return Err(ValidationError::Task {
                        task: self.name.clone(),
                        detail: "the output of a sequence task cannot be captured".to_string(),
                    }
                    .into());
                }
                self.reject_passthrough(&parsed)?;
                let mut first_failure: Option<(String, i32)> = None;
                for item in items {
                    executor::check_cancelled(&ctx.cancel)?;
                    let code = item.run(ctx, &[], Some(&env), Some(&cwd), false)?;
                    if code == 0 {
                        continue;
                    }
                    match ignore_fail {
                        IgnoreFail::Abort => {
                            ctx.ui.error(&format!(
                                "Sequence aborted after '{}' failed with exit code {code}",
                                item.label()
                            ));
                            return Ok(code);
                        }
                        IgnoreFail::Ignore => {
                            log::debug!(
                                "Ignoring failure of '{}' (exit code {code})",
                                item.label()
                            );
                        }
                        IgnoreFail::ReturnNonZero => {
                            if first_failure.is_none() {
                                first_failure = Some((item.label(), code));
                            }
                        }
                    }
                }
                match first_failure {
                    Some((label, code)) => {
                        ctx.ui
                            .error(&format!("Subtask '{label}' failed with exit code {code}"));
                        Ok(code)
                    }
                    None => Ok(0),
                }
            }
            TaskKind::Switch {
                control,
                cases,
                on_miss,
            } => {
                let code = control.run(ctx, &[], Some(&env), Some(&cwd), true)?;
                if code != 0 {
                    return Err(ExecutionError::TaskFailed {
                        task: control.name.clone(),
                        code,
                    }
                    .into());
                }
                let control_invocation = Invocation::bare(control.name.clone());
                let Some(value) = ctx.joined_output(&control_invocation) else {
                    // Dry run: the control never spawned, so the branch is
                    // undecidable.
                    ctx.ui.action(
                        ActionStyle::Unresolved,
                        &format!("{} (switch case undecided)", self.name),
                    );
                    return Ok(0);
                };
                log::debug!("Switch '{}' control produced '{value}'", self.name);

                let matched = cases
                    .iter()
                    .find(|case| case.values.iter().any(|v| v == &value))
                    .or_else(|| {
                        cases
                            .iter()
                            .find(|case| case.values.iter().any(|v| v == SWITCH_DEFAULT_CASE))
                    });
                match matched {
                    Some(case) => {
                        let code = case.task.run(
                            ctx,
                            parsed.passthrough(),
                            Some(&env),
                            Some(&cwd),
                            capture,
                        )?;
                        if capture && code == 0 {
                            let stored = Invocation::new(
                                case.task.name.clone(),
                                parsed.passthrough().to_vec(),
                            );
                            self.alias_capture(ctx, &stored, extra_args)?;
                        }
                        Ok(code)
                    }
                    None => match on_miss {
                        CaseMiss::Pass => Ok(0),
                        CaseMiss::Fail => Err(ExecutionError::SwitchFallthrough {
                            task: self.name.clone(),
                            value,
                        }
                        .into()),
                    },
                }
            }
        }
    }

    /// The task's effective working directory: its own (templated) `cwd`
    /// anchored at the project root, an inherited one, or the project root.
    /// The result must stay inside the project.
    fn working_dir(
        &self,
        ctx: &RunContext<'_>,
        env: &EnvVarsManager,
        default_cwd: Option<&Path>,
    ) -> PoeResult<PathBuf> {
        let project = &ctx.config.project_dir;
        let resolved = match &self.opts.cwd {
            Some(raw) => {
                let expanded = env.expand(raw);
                let path = Path::new(&expanded);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    project.join(path)
                }
            }
            None => match default_cwd {
                Some(inherited) => inherited.to_path_buf(),
                None => project.clone(),
            },
        };
        let resolved = normalize_path(&resolved);
        if !resolved.starts_with(project) {
            return Err(ValidationError::Task {
                task: self.name.clone(),
                detail: format!(
                    "cwd '{}' resolves outside the project directory",
                    resolved.display()
                ),
            }
            .into());
        }
        Ok(resolved)
    }

    /// Where the child's stdout goes: forced context capture for `uses` and
    /// switch controls, the task's own `capture_stdout` setting otherwise.
    fn capture_mode(&self, forced: bool, env: &EnvVarsManager, cwd: &Path) -> Capture {
        if forced {
            return Capture::Context;
        }
        match &self.opts.capture_stdout {
            None | Some(CaptureSpec::Flag(false)) => Capture::Inherit,
            Some(CaptureSpec::Flag(true)) => Capture::Context,
            Some(CaptureSpec::File(raw)) => {
                let expanded = env.expand(raw);
                let path = Path::new(&expanded);
                if path.is_absolute() {
                    Capture::File(path.to_path_buf())
                } else {
                    Capture::File(cwd.join(path))
                }
            }
        }
    }

    /// Prints the action line for a leaf task about to run.
    fn announce(&self, ctx: &RunContext<'_>, capture: &Capture, unresolved: bool, text: &str) {
        let style = if unresolved {
            ActionStyle::Unresolved
        } else if matches!(capture, Capture::Context | Capture::File(_)) {
            ActionStyle::Capture
        } else {
            ActionStyle::Run
        };
        ctx.ui.action(style, text);
    }

    /// Declared args as Python bindings; absent optionals bind to `None`.
    fn arg_bindings(&self, parsed: &ParsedArgs) -> Vec<(String, Option<ArgValue>)> {
        self.opts
            .args
            .iter()
            .map(|def| (def.name.clone(), parsed.get(&def.name).cloned()))
            .collect()
    }

    /// Variants with no argv surface refuse leftover CLI tokens.
    fn reject_passthrough(&self, parsed: &ParsedArgs) -> Result<(), ArgError> {
        match parsed.passthrough().first() {
            Some(token) => Err(ArgError::Unrecognized {
                task: self.name.clone(),
                token: token.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Re-stores a delegated capture under this task's own invocation, so
    /// consumers that named this task find the output.
    fn alias_capture(
        &self,
        ctx: &mut RunContext<'_>,
        stored: &Invocation,
        extra_args: &[String],
    ) -> PoeResult<()> {
        if let Some(text) = ctx.task_output(stored).map(str::to_string) {
            ctx.save_task_output(
                &Invocation::new(self.name.clone(), extra_args.to_vec()),
                text.into_bytes(),
            )?;
        }
        Ok(())
    }

    /// Builds and runs the executor job for a leaf variant.
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        ctx: &mut RunContext<'_>,
        argv: Vec<String>,
        stdin: Option<String>,
        cwd: PathBuf,
        env: EnvVarsManager,
        capture: Capture,
        extra_args: &[String],
        use_exec: bool,
    ) -> PoeResult<i32> {
        let job = Job {
            task: self.name.clone(),
            invocation: Invocation::new(self.name.clone(), extra_args.to_vec()),
            argv,
            stdin,
            cwd,
            env,
            capture,
            use_exec,
        };
        Ok(executor::run(ctx, job)?)
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> GlobalOptions {
        GlobalOptions {
            default_task_type: "cmd".to_string(),
            default_array_task_type: "sequence".to_string(),
            default_array_item_task_type: "ref".to_string(),
            env: Vec::new(),
            envfile: Vec::new(),
            executor: None,
            poetry_command: "poetry".to_string(),
            poetry_hooks: Vec::new(),
            shell_interpreter: vec!["posix".to_string()],
            verbosity: 0,
        }
    }

    fn origin() -> TaskOrigin {
        TaskOrigin {
            conf_dir: PathBuf::from("/project"),
            default_cwd: None,
        }
    }

    fn make(name: &str, value: Value) -> PoeResult<Task> {
        Task::from_def(name, &value, &options(), origin())
    }

    #[test]
    fn test_string_task_normalizes_to_cmd() {
        let task = make("build", json!("cargo build")).unwrap();
        match &task.kind {
            TaskKind::Cmd { cmd } => assert_eq!(cmd, "cargo build"),
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(task.opts.deps.is_empty());
    }

    #[test]
    fn test_array_task_normalizes_to_ref_sequence() {
        let task = make("all", json!(["lint", "test --fast"])).unwrap();
        match &task.kind {
            TaskKind::Sequence { items, ignore_fail } => {
                assert_eq!(*ignore_fail, IgnoreFail::Abort);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].name, "all[0]");
                match &items[1].kind {
                    TaskKind::Ref { target } => assert_eq!(target, "test --fast"),
                    other => panic!("unexpected kind {other:?}"),
                }
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_task_names_are_validated() {
        assert!(make("9lives", json!("echo no")).is_err());
        assert!(make("bad name", json!("echo no")).is_err());
        assert!(make("_hidden", json!("echo ok")).is_ok());
        assert!(make("build:dev+x-1", json!("echo ok")).is_ok());
    }

    #[test]
    fn test_table_requires_exactly_one_content_key() {
        let err = make("x", json!({"env": {"A": "1"}})).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
        let err = make("x", json!({"cmd": "a", "shell": "b"})).unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn test_unknown_option_is_rejected_per_variant() {
        // interpreter belongs to shell tasks, not cmd tasks
        let err = make("x", json!({"cmd": "echo", "interpreter": "bash"})).unwrap_err();
        assert!(err.to_string().contains("unknown option 'interpreter'"));
        assert!(make("x", json!({"shell": "echo hi", "interpreter": "bash"})).is_ok());
    }

    #[test]
    fn test_case_key_is_only_valid_inside_a_switch() {
        let err = make("x", json!({"cmd": "echo", "case": "dev"})).unwrap_err();
        assert!(err.to_string().contains("unknown option 'case'"));
    }

    #[test]
    fn test_include_cwd_anchors_the_task_cwd() {
        let origin = TaskOrigin {
            conf_dir: PathBuf::from("/project/sub"),
            default_cwd: Some("sub".to_string()),
        };
        let with_own = Task::from_def(
            "a",
            &json!({"cmd": "echo", "cwd": "deep"}),
            &options(),
            origin.clone(),
        )
        .unwrap();
        assert_eq!(
            Path::new(with_own.opts.cwd.as_deref().unwrap()),
            Path::new("sub").join("deep")
        );

        let without = Task::from_def("b", &json!({"cmd": "echo"}), &options(), origin).unwrap();
        assert_eq!(without.opts.cwd.as_deref(), Some("sub"));
    }

    #[test]
    fn test_sequence_items_cannot_declare_args() {
        let err = make(
            "seq",
            json!({"sequence": [{"cmd": "echo", "args": ["x"]}]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot declare args"));
    }

    #[test]
    fn test_sequence_ignore_fail_modes() {
        let task = make(
            "seq",
            json!({"sequence": ["a"], "ignore_fail": "return_non_zero"}),
        )
        .unwrap();
        match &task.kind {
            TaskKind::Sequence { ignore_fail, .. } => {
                assert_eq!(*ignore_fail, IgnoreFail::ReturnNonZero)
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(make("seq", json!({"sequence": ["a"], "ignore_fail": "maybe"})).is_err());
    }

    #[test]
    fn test_sequence_item_type_must_be_a_leaf_type() {
        let err = make(
            "seq",
            json!({"sequence": ["a"], "default_item_type": "sequence"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default_item_type"));
    }

    #[test]
    fn test_switch_parses_cases_and_default() {
        let task = make(
            "pick",
            json!({
                "control": "echo linux",
                "switch": [
                    {"case": "linux", "cmd": "echo tux"},
                    {"case": ["darwin", "mac"], "cmd": "echo apple"},
                    {"cmd": "echo other"},
                ],
                "default": "pass",
            }),
        )
        .unwrap();
        match &task.kind {
            TaskKind::Switch {
                control,
                cases,
                on_miss,
            } => {
                assert_eq!(control.name, "pick[control]");
                assert_eq!(cases.len(), 3);
                assert_eq!(cases[1].values, vec!["darwin", "mac"]);
                assert_eq!(cases[2].values, vec![SWITCH_DEFAULT_CASE]);
                assert_eq!(*on_miss, CaseMiss::Pass);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_switch_rejects_duplicate_cases_and_defaults() {
        let err = make(
            "pick",
            json!({
                "control": "echo x",
                "switch": [
                    {"case": "a", "cmd": "echo 1"},
                    {"case": ["b", "a"], "cmd": "echo 2"},
                ],
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicated case value 'a'"));

        let err = make(
            "pick",
            json!({
                "control": "echo x",
                "switch": [{"cmd": "echo 1"}, {"cmd": "echo 2"}],
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at most one default case"));
    }

    #[test]
    fn test_switch_control_must_produce_output() {
        let err = make(
            "pick",
            json!({"control": {"ref": "other"}, "switch": [{"cmd": "echo 1"}]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cmd, script or expr"));
    }

    #[test]
    fn test_composite_tasks_cannot_capture_stdout() {
        let helper = make("a", json!("echo one")).unwrap();
        let seq = make(
            "seq",
            json!({"sequence": ["a"], "capture_stdout": "seq.txt"}),
        )
        .unwrap();
        let pick = make(
            "pick",
            json!({
                "control": "echo x",
                "switch": [{"cmd": "echo 1"}],
                "capture_stdout": "pick.txt",
            }),
        )
        .unwrap();
        let config = Config {
            project_dir: PathBuf::from("/project"),
            source: PathBuf::from("/project/pyproject.toml"),
            options: options(),
            tasks: vec![helper, seq.clone(), pick.clone()],
            has_poetry_project: false,
        };

        let err = seq.validate(&config).unwrap_err();
        assert!(
            err.to_string()
                .contains("capture_stdout cannot be used on a sequence")
        );
        let err = pick.validate(&config).unwrap_err();
        assert!(err.to_string().contains("cannot be used on a switch"));
    }

    #[test]
    fn test_env_values_accept_defaults() {
        let task = make(
            "x",
            json!({"cmd": "echo", "env": {"A": "1", "B": {"default": "2"}}}),
        )
        .unwrap();
        assert_eq!(
            task.opts.env,
            vec![
                ("A".to_string(), EnvValue::Literal("1".to_string())),
                ("B".to_string(), EnvValue::Defaulted("2".to_string())),
            ]
        );
        assert!(make("x", json!({"cmd": "echo", "env": {"A": 1}})).is_err());
    }

    #[test]
    fn test_uses_keys_must_be_identifiers() {
        assert!(make("x", json!({"cmd": "echo", "uses": {"OK_1": "other"}})).is_ok());
        let err = make("x", json!({"cmd": "echo", "uses": {"not-ok": "other"}})).unwrap_err();
        assert!(err.to_string().contains("not a valid environment variable"));
    }

    #[test]
    fn test_unknown_executor_type_is_rejected() {
        let err = make(
            "x",
            json!({"cmd": "echo", "executor": {"type": "docker"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown executor type"));
    }

    #[test]
    fn test_upstream_splits_invocations() {
        let task = make(
            "x",
            json!({
                "cmd": "echo",
                "deps": ["build --fast", "lint"],
                "uses": {"REV": "rev HEAD"},
            }),
        )
        .unwrap();
        let env = EnvVarsManager::from_map(std::collections::HashMap::new());
        let (deps, uses) = task.upstream(&env).unwrap();
        assert_eq!(
            deps,
            vec![
                Invocation::new("build", vec!["--fast".to_string()]),
                Invocation::bare("lint"),
            ]
        );
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "REV");
        assert_eq!(uses[0].1, Invocation::new("rev", vec!["HEAD".to_string()]));
    }

    #[test]
    fn test_ref_items_are_labelled_by_target() {
        let task = make("all", json!(["check --fast"])).unwrap();
        match &task.kind {
            TaskKind::Sequence { items, .. } => assert_eq!(items[0].label(), "check"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_normalize_path_is_lexical() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/a/../..")), PathBuf::from("/"));
    }
}
