//! Interpreter selection and Python code generation.
//!
//! Shell tasks hand their content to an interpreter over stdin; this module
//! maps the configured interpreter families to concrete binaries and their
//! invocation flags. Script and expr tasks run Python one-liners assembled
//! here, with the task's parsed args bound as typed Python literals.

use crate::core::args::ArgValue;
use crate::core::template;
use crate::errors::{ExecutionError, ParseError, ValidationError};
use crate::models::AssertSpec;
use crate::system::executor;

// --- Families ---

/// Interpreter families accepted by `shell_interpreter` and the per-task
/// `interpreter` option.
pub fn is_known_family(name: &str) -> bool {
    matches!(
        name,
        "posix" | "sh" | "bash" | "zsh" | "fish" | "pwsh" | "powershell" | "python"
    )
}

/// Binaries to probe for a family, in order of preference.
fn candidates(family: &str) -> &'static [&'static str] {
    match family {
        "posix" => &["sh", "bash", "zsh"],
        "sh" => &["sh"],
        "bash" => &["bash"],
        "zsh" => &["zsh"],
        "fish" => &["fish"],
        "pwsh" => &["pwsh"],
        "powershell" => &["powershell", "pwsh"],
        "python" => &["python3", "python"],
        _ => &[],
    }
}

/// Flags that make the interpreter read its script from stdin.
fn invocation_args(family: &str) -> &'static [&'static str] {
    match family {
        "pwsh" | "powershell" => &["-NoLogo", "-Command", "-"],
        "python" => &["-"],
        _ => &[],
    }
}

/// Picks the first family with a binary on `PATH` and returns the program
/// name plus its stdin-mode flags.
pub fn resolve(
    families: &[String],
    path_var: Option<&str>,
) -> Result<(String, Vec<String>), ExecutionError> {
    for family in families {
        for candidate in candidates(family) {
            if executor::find_executable(candidate, path_var).is_some() {
                log::debug!("Interpreter family '{family}' resolved to '{candidate}'");
                let args = invocation_args(family)
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect();
                return Ok((candidate.to_string(), args));
            }
        }
    }
    Err(ExecutionError::NoInterpreter {
        tried: families.join(", "),
    })
}

/// The Python to run script and expr tasks with outside a virtualenv.
pub fn find_python(path_var: Option<&str>) -> Result<String, ExecutionError> {
    for candidate in ["python3", "python"] {
        if executor::find_executable(candidate, path_var).is_some() {
            return Ok(candidate.to_string());
        }
    }
    Err(ExecutionError::NoInterpreter {
        tried: "python3, python".to_string(),
    })
}

// --- Script references ---

/// A parsed script task reference: `my.module:function` or
/// `my.module:function(args...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSpec {
    pub module: String,
    pub function: String,
    /// The full call expression; a bare reference becomes a no-arg call.
    pub call: String,
}

pub fn parse_script_reference(task: &str, content: &str) -> Result<ScriptSpec, ValidationError> {
    let invalid = |detail: String| ValidationError::Task {
        task: task.to_string(),
        detail,
    };

    let Some((module, func_part)) = content.split_once(':') else {
        return Err(invalid(
            "script must take the form 'my.module:function' or 'my.module:function(...)'"
                .to_string(),
        ));
    };
    let module = module.trim();
    let func_part = func_part.trim();
    if module.is_empty() || !module.split('.').all(template::is_valid_identifier) {
        return Err(invalid(format!("'{module}' is not a valid module path")));
    }

    let (function, call) = match func_part.split_once('(') {
        Some((name, _)) => {
            if !func_part.ends_with(')') {
                return Err(invalid(
                    "unbalanced parentheses in script reference".to_string(),
                ));
            }
            (name.trim(), func_part.to_string())
        }
        None => (func_part, format!("{func_part}()")),
    };
    if !template::is_valid_identifier(function) {
        return Err(invalid(format!("'{function}' is not a valid function name")));
    }

    Ok(ScriptSpec {
        module: module.to_string(),
        function: function.to_string(),
        call,
    })
}

// --- Expression validation ---

/// Checks an expr task's content for constructs that would smuggle in
/// statements. The expression still gets its real syntax check from Python;
/// this only rejects what must never reach it.
pub fn validate_expression(expr: &str) -> Result<(), ParseError> {
    let reject = |detail: &str| ParseError::Expression {
        detail: detail.to_string(),
    };

    let mut chars = expr.chars().peekable();
    let mut quote: Option<char> = None;
    let mut word = String::new();
    let check_word = |word: &mut String| -> Result<(), ParseError> {
        let result = match word.as_str() {
            "await" | "yield" => Err(reject("statement keywords are not allowed")),
            "import" => Err(reject("use the imports option instead of inline imports")),
            w if w.contains("__") => Err(reject("dunder names are not allowed")),
            _ => Ok(()),
        };
        word.clear();
        result
    };

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                check_word(&mut word)?;
                quote = Some(c);
            }
            ';' => return Err(reject("statements are not allowed")),
            ':' if chars.peek() == Some(&'=') => {
                return Err(reject("assignment is not allowed"));
            }
            c if c.is_alphanumeric() || c == '_' => word.push(c),
            _ => check_word(&mut word)?,
        }
    }
    check_word(&mut word)?;
    if quote.is_some() {
        return Err(reject("unterminated string literal"));
    }
    Ok(())
}

// --- Python code generation ---

/// Renders a parsed arg value (or its absence) as a Python literal.
pub fn python_literal(value: Option<&ArgValue>) -> String {
    match value {
        None => "None".to_string(),
        Some(ArgValue::Str(s)) => quote_py(s),
        Some(ArgValue::Int(i)) => i.to_string(),
        Some(ArgValue::Float(f)) => format!("{f:?}"),
        Some(ArgValue::Bool(b)) => if *b { "True" } else { "False" }.to_string(),
        Some(ArgValue::List(items)) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| python_literal(Some(item)))
                .collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}

fn quote_py(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Builds the `python -c` payload for a script task: import the target,
/// bind the declared args, call it, and await the result if it turns out to
/// be a coroutine.
pub fn script_bootstrap(
    spec: &ScriptSpec,
    bindings: &[(String, Option<ArgValue>)],
    print_result: bool,
) -> String {
    let mut lines = vec![
        "import asyncio, os, sys".to_string(),
        format!("from {} import {}", spec.module, spec.function),
    ];
    for (name, value) in bindings {
        lines.push(format!("{name} = {}", python_literal(value.as_ref())));
    }
    lines.push(format!("_result = {}", spec.call));
    lines.push(
        "_result = asyncio.run(_result) if asyncio.iscoroutine(_result) else _result".to_string(),
    );
    if print_result {
        lines.push("print(_result) if _result is not None else None".to_string());
    }
    lines.join("\n")
}

/// Builds the `python -c` payload for an expr task. The expression sees the
/// declared args as variables and the environment as `environ`; its result
/// is always printed, and `assert` turns a falsy result into an exit code.
pub fn expr_bootstrap(
    expr: &str,
    imports: &[String],
    bindings: &[(String, Option<ArgValue>)],
    assertion: Option<&AssertSpec>,
) -> String {
    let mut lines = vec!["import os, sys".to_string()];
    for import in imports {
        lines.push(format!("import {import}"));
    }
    lines.push("environ = os.environ".to_string());
    for (name, value) in bindings {
        lines.push(format!("{name} = {}", python_literal(value.as_ref())));
    }
    lines.push(format!("_result = ({expr})"));
    lines.push("print(_result)".to_string());
    let exit_code = match assertion {
        None | Some(AssertSpec::Flag(false)) => None,
        Some(AssertSpec::Flag(true)) => Some(1),
        Some(AssertSpec::Code(code)) => Some(*code),
    };
    if let Some(code) = exit_code {
        lines.push(format!("sys.exit(0 if _result else {code})"));
    }
    lines.join("\n")
}

// --- Shell content ---

/// Leading run of spaces and tabs, in characters. Other whitespace (form
/// feeds, non-breaking spaces) is content, not indentation.
fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| matches!(*c, ' ' | '\t')).count()
}

/// Strips the common leading indentation from a multi-line script, so shell
/// content indented inside a TOML string runs as written.
pub fn unindent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(indent_width)
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return text.to_string();
    }
    text.lines()
        .map(|line| {
            let mut rest = line;
            for _ in 0..indent {
                match rest.strip_prefix([' ', '\t']) {
                    Some(stripped) => rest = stripped,
                    None => break,
                }
            }
            rest
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_reference_forms() {
        let bare = parse_script_reference("t", "my.pkg.tasks:build").unwrap();
        assert_eq!(bare.module, "my.pkg.tasks");
        assert_eq!(bare.function, "build");
        assert_eq!(bare.call, "build()");

        let call = parse_script_reference("t", "pkg:run(target, fast=fast)").unwrap();
        assert_eq!(call.call, "run(target, fast=fast)");
    }

    #[test]
    fn test_script_reference_rejections() {
        for bad in ["no_colon", "1bad.mod:fn", "pkg:not valid", "pkg:fn(oops"] {
            assert!(
                parse_script_reference("t", bad).is_err(),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn test_expression_validation() {
        assert!(validate_expression("1 + 2 * x").is_ok());
        assert!(validate_expression("'a;b' in environ['PATH']").is_ok());
        assert!(validate_expression("sys.platform == 'linux'").is_ok());

        assert!(validate_expression("x := 1").is_err());
        assert!(validate_expression("1; import os").is_err());
        assert!(validate_expression("await thing()").is_err());
        assert!(validate_expression("x.__class__").is_err());
        assert!(validate_expression("__import__('os')").is_err());
        assert!(validate_expression("'unterminated").is_err());
    }

    #[test]
    fn test_python_literals() {
        assert_eq!(python_literal(None), "None");
        assert_eq!(
            python_literal(Some(&ArgValue::Str("it's a \\ test".to_string()))),
            "'it\\'s a \\\\ test'"
        );
        assert_eq!(python_literal(Some(&ArgValue::Int(-3))), "-3");
        assert_eq!(python_literal(Some(&ArgValue::Float(2.0))), "2.0");
        assert_eq!(python_literal(Some(&ArgValue::Bool(true))), "True");
        assert_eq!(
            python_literal(Some(&ArgValue::List(vec![
                ArgValue::Str("a".to_string()),
                ArgValue::Str("b".to_string()),
            ]))),
            "['a', 'b']"
        );
    }

    #[test]
    fn test_script_bootstrap_shape() {
        let spec = parse_script_reference("t", "demo.tasks:greet(name)").unwrap();
        let bindings = vec![("name".to_string(), Some(ArgValue::Str("poe".to_string())))];
        let code = script_bootstrap(&spec, &bindings, true);
        assert!(code.contains("from demo.tasks import greet"));
        assert!(code.contains("name = 'poe'"));
        assert!(code.contains("_result = greet(name)"));
        assert!(code.contains("print(_result)"));
    }

    #[test]
    fn test_expr_bootstrap_shape() {
        let code = expr_bootstrap(
            "len(sys.argv) < limit",
            &["sys".to_string()],
            &[("limit".to_string(), Some(ArgValue::Int(3)))],
            Some(&AssertSpec::Code(7)),
        );
        assert!(code.contains("import sys"));
        assert!(code.contains("limit = 3"));
        assert!(code.contains("_result = (len(sys.argv) < limit)"));
        assert!(code.ends_with("sys.exit(0 if _result else 7)"));
    }

    #[test]
    fn test_unindent() {
        let script = "\n    if true; then\n      echo yes\n    fi\n";
        assert_eq!(unindent(script), "\nif true; then\n  echo yes\nfi");
        assert_eq!(unindent("plain"), "plain");
    }

    #[test]
    fn test_unindent_counts_only_spaces_and_tabs() {
        // A non-breaking space is content: it neither widens the common
        // indent of its own line nor gets stripped from it.
        assert_eq!(unindent(" x\n\u{a0}y"), " x\n\u{a0}y");
        assert_eq!(unindent("  a\n  \u{a0}b"), "a\n\u{a0}b");
        assert_eq!(unindent("\tone\n\ttwo"), "one\ntwo");
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_probes_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("zsh");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&fake).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake, perms).unwrap();

        let path = dir.path().to_str().unwrap();
        let (program, args) = resolve(&["zsh".to_string()], Some(path)).unwrap();
        assert_eq!(program, "zsh");
        assert!(args.is_empty());

        let err = resolve(&["fish".to_string()], Some(path)).unwrap_err();
        assert!(matches!(err, ExecutionError::NoInterpreter { .. }));
    }
}
