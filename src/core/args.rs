//! Declared task arguments.
//!
//! A task can declare named arguments; the CLI tokens following the task name
//! are then parsed against those declarations instead of being appended to
//! the command verbatim. This module normalizes the two accepted `args`
//! shapes (list or map) into [`ArgDef`]s at load time and parses the runtime
//! tokens into typed [`ArgValue`]s.

use crate::core::template;
use crate::errors::{ArgError, ValidationError};
use crate::models::{ArgDefault, ArgSpec, ArgsSpec, MultipleSpec, PositionalSpec};
use serde_json::Value;
use std::collections::HashMap;

// --- Definitions ---

/// Value types an argument can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
}

impl ArgType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }
}

/// How many values an argument consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arity {
    #[default]
    One,
    /// `multiple = true`: one or more.
    Many,
    /// `multiple = <n>`: exactly n.
    Exactly(usize),
}

/// A validated argument definition.
#[derive(Debug, Clone)]
pub struct ArgDef {
    pub name: String,
    /// Flags accepted on the command line. Empty for positional args.
    pub flags: Vec<String>,
    pub positional: bool,
    /// The name shown to users: the positional rename if one was given.
    pub display: String,
    pub value_type: ArgType,
    pub arity: Arity,
    pub required: bool,
    pub default: Option<ArgDefault>,
    pub help: Option<String>,
}

/// Normalizes a task's `args` option into an ordered list of definitions,
/// running every per-arg and cross-arg validation.
pub fn normalize_args(task: &str, spec: &ArgsSpec) -> Result<Vec<ArgDef>, ValidationError> {
    let invalid = |detail: String| ValidationError::Task {
        task: task.to_string(),
        detail,
    };

    let mut defs = Vec::new();
    match spec {
        ArgsSpec::List(entries) => {
            for entry in entries {
                match entry {
                    Value::String(name) => defs.push(build_def(task, name, &ArgSpec::default())?),
                    Value::Object(_) => {
                        let arg: ArgSpec = serde_json::from_value(entry.clone())
                            .map_err(|e| invalid(format!("invalid args entry: {e}")))?;
                        let name = arg
                            .name
                            .clone()
                            .ok_or_else(|| invalid("args entry is missing a name".to_string()))?;
                        defs.push(build_def(task, &name, &arg)?);
                    }
                    _ => {
                        return Err(invalid(
                            "args entries must be names or tables".to_string(),
                        ));
                    }
                }
            }
        }
        ArgsSpec::Map(map) => {
            for (name, value) in map {
                let arg: ArgSpec = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(format!("invalid args entry '{name}': {e}")))?;
                if arg.name.is_some() {
                    return Err(invalid(format!(
                        "args entry '{name}' must not repeat the name option"
                    )));
                }
                defs.push(build_def(task, name, &arg)?);
            }
        }
    }

    // Cross-arg checks: unique names and flags, and at most one multiple
    // positional, which must come last.
    let mut seen_names: Vec<&str> = Vec::new();
    let mut seen_flags: Vec<&str> = Vec::new();
    for def in &defs {
        if seen_names.contains(&def.name.as_str()) {
            return Err(invalid(format!(
                "argument '{}' is declared more than once",
                def.name
            )));
        }
        seen_names.push(&def.name);
        for flag in &def.flags {
            if seen_flags.contains(&flag.as_str()) {
                return Err(invalid(format!("flag '{flag}' is declared more than once")));
            }
            seen_flags.push(flag);
        }
    }
    let positionals: Vec<&ArgDef> = defs.iter().filter(|d| d.positional).collect();
    for def in positionals.iter().rev().skip(1) {
        if def.arity != Arity::One {
            return Err(invalid(format!(
                "only the last positional argument may be multiple (found '{}')",
                def.display
            )));
        }
    }

    Ok(defs)
}

fn build_def(task: &str, name: &str, arg: &ArgSpec) -> Result<ArgDef, ValidationError> {
    let invalid = |detail: String| ValidationError::Task {
        task: task.to_string(),
        detail,
    };

    if !template::is_valid_identifier(name) {
        return Err(invalid(format!(
            "argument name '{name}' is not a valid identifier"
        )));
    }

    let value_type = match &arg.value_type {
        None => ArgType::default(),
        Some(t) => ArgType::from_name(t).ok_or_else(|| {
            invalid(format!(
                "argument '{name}' has unknown type '{t}' (expected string, integer, float or boolean)"
            ))
        })?,
    };

    let (positional, display) = match &arg.positional {
        None | Some(PositionalSpec::Flag(false)) => (false, name.to_string()),
        Some(PositionalSpec::Flag(true)) => (true, name.to_string()),
        Some(PositionalSpec::Rename(rename)) => (true, rename.clone()),
    };

    let flags = if positional {
        if arg.options.is_some() {
            return Err(invalid(format!(
                "positional argument '{display}' cannot declare options"
            )));
        }
        if value_type == ArgType::Boolean {
            return Err(invalid(format!(
                "positional argument '{display}' cannot be boolean"
            )));
        }
        Vec::new()
    } else {
        let flags = arg
            .options
            .clone()
            .unwrap_or_else(|| vec![format!("--{name}")]);
        for flag in &flags {
            if !flag.starts_with('-') || flag.len() < 2 {
                return Err(invalid(format!(
                    "flag '{flag}' of argument '{name}' must start with '-'"
                )));
            }
        }
        flags
    };

    let arity = match &arg.multiple {
        None | Some(MultipleSpec::Flag(false)) => Arity::One,
        Some(MultipleSpec::Flag(true)) => Arity::Many,
        Some(MultipleSpec::Count(n)) => match usize::try_from(*n) {
            Ok(n) if n >= 2 => Arity::Exactly(n),
            _ => {
                return Err(invalid(format!(
                    "argument '{name}': multiple accepts true or an integer greater than 1"
                )));
            }
        },
    };
    if arity != Arity::One && value_type == ArgType::Boolean {
        return Err(invalid(format!(
            "boolean argument '{name}' cannot be multiple"
        )));
    }

    let required = arg.required.unwrap_or(false);
    if required && arg.default.is_some() {
        return Err(invalid(format!(
            "required argument '{name}' cannot declare a default"
        )));
    }
    if let Some(default) = &arg.default {
        let matches_type = match default {
            ArgDefault::Str(_) => true,
            ArgDefault::Bool(_) => value_type == ArgType::Boolean,
            ArgDefault::Int(_) => matches!(value_type, ArgType::Integer | ArgType::Float),
            ArgDefault::Float(_) => value_type == ArgType::Float,
        };
        if !matches_type {
            return Err(invalid(format!(
                "default value for argument '{name}' does not match its type"
            )));
        }
    }

    Ok(ArgDef {
        name: name.to_string(),
        flags,
        positional,
        display,
        value_type,
        arity,
        required,
        default: arg.default.clone(),
        help: arg.help.clone(),
    })
}

// --- Parsed values ---

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// The value as it binds into the task environment. Lists join with
    /// single spaces.
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => items
                .iter()
                .map(Self::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// The outcome of parsing a task's extra CLI tokens.
#[derive(Debug, Clone, Default)]
pub struct ParsedArgs {
    /// Set values in declaration order. Absent optional args do not appear.
    values: Vec<(String, ArgValue)>,
    /// Tokens to append to the command verbatim: everything when the task
    /// declares no args, otherwise only what follows a literal `--`.
    passthrough: Vec<String>,
}

impl ParsedArgs {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn env_bindings(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.render()))
    }

    pub fn passthrough(&self) -> &[String] {
        &self.passthrough
    }
}

// --- Parsing ---

fn looks_like_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

/// Splits `--flag=value` into the flag and its inline value.
fn split_inline(token: &str) -> (&str, Option<&str>) {
    match token.split_once('=') {
        Some((flag, value)) => (flag, Some(value)),
        None => (token, None),
    }
}

fn coerce(task: &str, def: &ArgDef, raw: &str) -> Result<ArgValue, ArgError> {
    let invalid = |expected: &'static str| ArgError::InvalidValue {
        task: task.to_string(),
        arg: def.display.clone(),
        value: raw.to_string(),
        expected,
    };
    match def.value_type {
        ArgType::String => Ok(ArgValue::Str(raw.to_string())),
        ArgType::Integer => raw
            .parse::<i64>()
            .map(ArgValue::Int)
            .map_err(|_| invalid("an integer")),
        ArgType::Float => raw
            .parse::<f64>()
            .map(ArgValue::Float)
            .map_err(|_| invalid("a number")),
        ArgType::Boolean => match raw {
            "true" => Ok(ArgValue::Bool(true)),
            "false" => Ok(ArgValue::Bool(false)),
            _ => Err(invalid("true or false")),
        },
    }
}

/// Parses the tokens that followed the task name on the command line.
///
/// With no declared args every token passes through untouched. Otherwise
/// flags are matched against the definitions (`--flag value`, `--flag=value`,
/// booleans as presence toggles), bare tokens fill positionals in order, and
/// a literal `--` ends parsing with the remainder passed through. Defaults
/// are template-expanded against `env` before type coercion.
pub fn parse_args(
    task: &str,
    defs: &[ArgDef],
    extra: &[String],
    env: &HashMap<String, String>,
) -> Result<ParsedArgs, ArgError> {
    if defs.is_empty() {
        return Ok(ParsedArgs {
            values: Vec::new(),
            passthrough: extra.to_vec(),
        });
    }

    let (to_parse, passthrough) = match extra.iter().position(|t| t == "--") {
        Some(i) => (&extra[..i], extra[i + 1..].to_vec()),
        None => (extra, Vec::new()),
    };

    let mut values: HashMap<&str, ArgValue> = HashMap::new();
    let positionals: Vec<&ArgDef> = defs.iter().filter(|d| d.positional).collect();
    let mut next_positional = 0usize;

    let mut tokens = to_parse.iter().peekable();
    while let Some(token) = tokens.next() {
        if looks_like_flag(token) {
            let (flag, inline) = split_inline(token);
            let def = defs
                .iter()
                .find(|d| d.flags.iter().any(|f| f == flag))
                .ok_or_else(|| ArgError::Unrecognized {
                    task: task.to_string(),
                    token: token.clone(),
                })?;

            if def.value_type == ArgType::Boolean {
                let value = match inline {
                    Some(raw) => coerce(task, def, raw)?,
                    None => ArgValue::Bool(true),
                };
                if values.insert(&def.name, value).is_some() {
                    return Err(duplicate(task, def));
                }
                continue;
            }

            match def.arity {
                Arity::One => {
                    let raw = match inline {
                        Some(raw) => raw.to_string(),
                        None => tokens
                            .next()
                            .ok_or_else(|| missing_value(task, flag))?
                            .clone(),
                    };
                    if values.insert(&def.name, coerce(task, def, &raw)?).is_some() {
                        return Err(duplicate(task, def));
                    }
                }
                Arity::Many | Arity::Exactly(_) => {
                    let limit = match def.arity {
                        Arity::Exactly(n) => n,
                        _ => usize::MAX,
                    };
                    let mut items = Vec::new();
                    if let Some(raw) = inline {
                        items.push(coerce(task, def, raw)?);
                    }
                    while items.len() < limit {
                        match tokens.peek() {
                            Some(next) if !looks_like_flag(next) => {
                                items.push(coerce(task, def, next)?);
                                tokens.next();
                            }
                            _ => break,
                        }
                    }
                    if items.is_empty() {
                        return Err(missing_value(task, flag));
                    }
                    if values.contains_key(def.name.as_str()) {
                        // Repeats only accumulate for unbounded args.
                        if def.arity != Arity::Many {
                            return Err(duplicate(task, def));
                        }
                        if let Some(ArgValue::List(existing)) =
                            values.get_mut(def.name.as_str())
                        {
                            existing.append(&mut items);
                        }
                    } else {
                        values.insert(&def.name, ArgValue::List(items));
                    }
                }
            }
        } else {
            let Some(&def) = positionals.get(next_positional) else {
                return Err(ArgError::Unrecognized {
                    task: task.to_string(),
                    token: token.clone(),
                });
            };
            let value = coerce(task, def, token)?;
            match def.arity {
                Arity::One => {
                    values.insert(&def.name, value);
                    next_positional += 1;
                }
                Arity::Many | Arity::Exactly(_) => {
                    let slot = values
                        .entry(&def.name)
                        .or_insert_with(|| ArgValue::List(Vec::new()));
                    let filled = if let ArgValue::List(items) = slot {
                        items.push(value);
                        items.len()
                    } else {
                        1
                    };
                    if def.arity == Arity::Exactly(filled) {
                        next_positional += 1;
                    }
                }
            }
        }
    }

    // Exact-count args must have been filled completely.
    for def in defs {
        if let Arity::Exactly(n) = def.arity {
            if let Some(ArgValue::List(items)) = values.get(def.name.as_str()) {
                if items.len() != n {
                    return Err(ArgError::WrongCount {
                        task: task.to_string(),
                        arg: def.display.clone(),
                        expected: n,
                        found: items.len(),
                    });
                }
            }
        }
    }

    // Defaults and required checks, then freeze in declaration order.
    let mut resolved = Vec::new();
    for def in defs {
        if let Some(value) = values.remove(def.name.as_str()) {
            resolved.push((def.name.clone(), value));
        } else if let Some(default) = &def.default {
            resolved.push((def.name.clone(), resolve_default(task, def, default, env)?));
        } else if def.required {
            return Err(ArgError::MissingRequired {
                task: task.to_string(),
                arg: def.display.clone(),
            });
        }
    }

    Ok(ParsedArgs {
        values: resolved,
        passthrough,
    })
}

fn resolve_default(
    task: &str,
    def: &ArgDef,
    default: &ArgDefault,
    env: &HashMap<String, String>,
) -> Result<ArgValue, ArgError> {
    let scalar = match default {
        ArgDefault::Bool(b) => ArgValue::Bool(*b),
        ArgDefault::Float(f) => ArgValue::Float(*f),
        ArgDefault::Int(i) => {
            if def.value_type == ArgType::Float {
                ArgValue::Float(*i as f64)
            } else {
                ArgValue::Int(*i)
            }
        }
        ArgDefault::Str(s) => {
            let expanded = template::expand(s, env, false);
            if def.arity == Arity::One {
                return coerce(task, def, &expanded);
            }
            // Multi-value args take whitespace-separated defaults.
            let items = expanded
                .split_whitespace()
                .map(|piece| coerce(task, def, piece))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(ArgValue::List(items));
        }
    };
    if def.arity == Arity::One {
        Ok(scalar)
    } else {
        Ok(ArgValue::List(vec![scalar]))
    }
}

fn duplicate(task: &str, def: &ArgDef) -> ArgError {
    ArgError::Duplicate {
        task: task.to_string(),
        arg: def.display.clone(),
    }
}

fn missing_value(task: &str, flag: &str) -> ArgError {
    ArgError::MissingValue {
        task: task.to_string(),
        flag: flag.to_string(),
    }
}

// MARK: --- UNIT TESTS ---
