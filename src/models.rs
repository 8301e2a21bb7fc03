// src/models.rs

use serde::Deserialize;
use serde_json::Value;

// --- Document Root ---

/// The raw options table of one configuration document: `[tool.poe]` inside
/// `pyproject.toml`, or the document root of a dedicated tasks file.
///
/// This struct captures shape only. Semantic checks (task forms, invariants,
/// include resolution) happen in `core::config` and `core::tasks`, which also
/// produce the precise per-task error messages serde cannot.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    pub default_task_type: Option<String>,
    pub default_array_task_type: Option<String>,
    pub default_array_item_task_type: Option<String>,
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,
    pub envfile: Option<StringOrList>,
    pub executor: Option<ExecutorSpec>,
    pub include: Option<IncludeSpec>,
    pub poetry_command: Option<String>,
    #[serde(default)]
    pub poetry_hooks: serde_json::Map<String, Value>,
    pub shell_interpreter: Option<StringOrList>,
    pub verbosity: Option<i64>,
    #[serde(default)]
    pub tasks: serde_json::Map<String, Value>,
}

/// One string or a list of strings. Used by `envfile`, `interpreter` and
/// `shell_interpreter`, which all accept both forms.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(list) => list.clone(),
        }
    }
}

/// The `executor` option table, global or per task.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Explicit virtualenv location, overriding the `./venv` / `./.venv`
    /// probe.
    pub location: Option<String>,
}

/// The `include` option: a single path, or a list of paths and
/// `{ path, cwd }` tables.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum IncludeSpec {
    One(String),
    Many(Vec<IncludeItem>),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum IncludeItem {
    Path(String),
    Detailed(IncludeTable),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IncludeTable {
    pub path: String,
    pub cwd: Option<String>,
}

impl IncludeSpec {
    /// Flattens the accepted forms into `(path, cwd)` pairs.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            Self::One(path) => vec![(path.clone(), None)],
            Self::Many(items) => items
                .iter()
                .map(|item| match item {
                    IncludeItem::Path(path) => (path.clone(), None),
                    IncludeItem::Detailed(table) => (table.path.clone(), table.cwd.clone()),
                })
                .collect(),
        }
    }
}

// --- Task Tables ---

/// A task defined as a table. Exactly one content key must be set; the key
/// whitelist is enforced against the raw document in `core::tasks` before
/// this is deserialized, so unknown keys never reach serde.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TaskTable {
    // Content keys.
    pub cmd: Option<String>,
    pub shell: Option<String>,
    pub script: Option<String>,
    pub expr: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub sequence: Option<Vec<Value>>,
    pub switch: Option<Vec<Value>>,

    // Variant-specific options.
    pub use_exec: Option<bool>,
    pub interpreter: Option<StringOrList>,
    pub print_result: Option<bool>,
    pub imports: Option<Vec<String>>,
    #[serde(rename = "assert")]
    pub assertion: Option<AssertSpec>,
    pub ignore_fail: Option<IgnoreFailSpec>,
    pub default_item_type: Option<String>,
    pub control: Option<Value>,
    pub default: Option<String>,
    /// Only valid on the direct children of a `switch` task.
    pub case: Option<Value>,

    // Common options.
    pub args: Option<ArgsSpec>,
    pub capture_stdout: Option<CaptureSpec>,
    pub cwd: Option<String>,
    pub deps: Option<Vec<String>>,
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,
    pub envfile: Option<StringOrList>,
    pub executor: Option<ExecutorSpec>,
    pub help: Option<String>,
    #[serde(default)]
    pub uses: serde_json::Map<String, Value>,
}

/// `capture_stdout`: `true` stores the child's stdout in the run context,
/// a string redirects it to that (templated) file path.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum CaptureSpec {
    Flag(bool),
    File(String),
}

/// `assert` on expr tasks: `true` exits 1 on a falsy result, an integer
/// picks the exit code.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AssertSpec {
    Flag(bool),
    Code(i64),
}

/// `ignore_fail` on sequences: `false` aborts, `true` swallows failures,
/// `"return_non_zero"` keeps going but reports a failing exit code.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum IgnoreFailSpec {
    Flag(bool),
    Mode(String),
}

// --- Argument Specs ---

/// `args`: a list of names / spec tables, or a map of name to spec table.
/// List entries stay raw so `core::args` can attribute errors to the exact
/// entry.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ArgsSpec {
    List(Vec<Value>),
    Map(serde_json::Map<String, Value>),
}

/// One declared argument of a task.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ArgSpec {
    /// Required in the list form; forbidden in the map form (the map key is
    /// the name).
    pub name: Option<String>,
    pub default: Option<ArgDefault>,
    pub help: Option<String>,
    /// The long/short flags accepted on the command line. Defaults to
    /// `--<name>`.
    pub options: Option<Vec<String>>,
    pub positional: Option<PositionalSpec>,
    pub required: Option<bool>,
    #[serde(rename = "type")]
    pub value_type: Option<String>,
    pub multiple: Option<MultipleSpec>,
}

/// Default values keep their document type so integer/float/boolean args can
/// default without quoting.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ArgDefault {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgDefault {
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
        }
    }
}

/// `positional`: `true`, or a rename string used in help output.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PositionalSpec {
    Flag(bool),
    Rename(String),
}

/// `multiple`: `true` for unbounded, an integer for an exact count.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MultipleSpec {
    Flag(bool),
    Count(i64),
}

// --- Normalized Values ---

/// A value in an `env` table after normalization: plain values always set
/// the key, `{ default = "…" }` sets it only when still unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    Defaulted(String),
}

impl EnvValue {
    /// Reads the two accepted document forms: a plain string, or a
    /// `{ default = "…" }` table. Anything else is `None` so the caller can
    /// report the offending key.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Literal(s.clone())),
            Value::Object(table) if table.len() == 1 => match table.get("default") {
                Some(Value::String(s)) => Some(Self::Defaulted(s.clone())),
                _ => None,
            },
            _ => None,
        }
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_document_rejects_unknown_keys() {
        let raw = serde_json::json!({ "tasks": {}, "bogus": 1 });
        let parsed: Result<ConfigDocument, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_string_or_list_forms() {
        let one: StringOrList = serde_json::from_value(serde_json::json!("a.env")).unwrap();
        let many: StringOrList =
            serde_json::from_value(serde_json::json!(["a.env", "b.env"])).unwrap();
        assert_eq!(one.to_vec(), vec!["a.env"]);
        assert_eq!(many.to_vec(), vec!["a.env", "b.env"]);
    }

    #[test]
    fn test_include_entries_flatten() {
        let spec: IncludeSpec = serde_json::from_value(serde_json::json!([
            "extra.toml",
            { "path": "sub/tasks.toml", "cwd": "sub" }
        ]))
        .unwrap();
        assert_eq!(
            spec.entries(),
            vec![
                ("extra.toml".to_string(), None),
                ("sub/tasks.toml".to_string(), Some("sub".to_string())),
            ]
        );
    }

    #[test]
    fn test_arg_default_keeps_document_type() {
        let b: ArgDefault = serde_json::from_value(serde_json::json!(true)).unwrap();
        let i: ArgDefault = serde_json::from_value(serde_json::json!(3)).unwrap();
        let f: ArgDefault = serde_json::from_value(serde_json::json!(2.5)).unwrap();
        assert_eq!(b.render(), "true");
        assert_eq!(i.render(), "3");
        assert_eq!(f.render(), "2.5");
    }

    #[test]
    fn test_capture_spec_forms() {
        let flag: CaptureSpec = serde_json::from_value(serde_json::json!(true)).unwrap();
        let file: CaptureSpec = serde_json::from_value(serde_json::json!("out.txt")).unwrap();
        assert_eq!(flag, CaptureSpec::Flag(true));
        assert_eq!(file, CaptureSpec::File("out.txt".to_string()));
    }

    #[test]
    fn test_env_value_forms() {
        let plain = EnvValue::from_json(&serde_json::json!("x"));
        let defaulted = EnvValue::from_json(&serde_json::json!({ "default": "y" }));
        assert_eq!(plain, Some(EnvValue::Literal("x".to_string())));
        assert_eq!(defaulted, Some(EnvValue::Defaulted("y".to_string())));
        assert_eq!(EnvValue::from_json(&serde_json::json!(1)), None);
        assert_eq!(
            EnvValue::from_json(&serde_json::json!({ "default": "y", "extra": 1 })),
            None
        );
    }
}
