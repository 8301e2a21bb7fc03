//! `.env` file parsing with per-run memoization.
//!
//! The format follows the common dotenv dialect: `NAME=VALUE` assignments
//! separated by whitespace or `;`, an optional `export` prefix, `#` comments,
//! and single/double quoting with their usual escape rules. Parsing is a
//! character-level state machine so errors carry an exact line and column.

use crate::core::env_manager::EnvVarsManager;
use crate::errors::{ExecutionError, PoeResult};
use crate::ui::Ui;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Memoizes parsed envfiles for the duration of one run, keyed by resolved
/// path. A file referenced by several tasks is read and parsed once.
#[derive(Debug, Default)]
pub struct EnvFileCache {
    files: HashMap<PathBuf, Arc<Vec<(String, String)>>>,
}

impl EnvFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the assignments of the envfile at `path` (already resolved to
    /// an absolute location). A missing file yields an empty mapping and a
    /// warning; a malformed file is a fatal error.
    pub fn get(&mut self, path: &Path, ui: &Ui) -> PoeResult<Arc<Vec<(String, String)>>> {
        if let Some(hit) = self.files.get(path) {
            return Ok(Arc::clone(hit));
        }

        let entries = if path.is_file() {
            let content = std::fs::read_to_string(path).map_err(|source| {
                ExecutionError::EnvFileIo {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            parse(&content).map_err(|e| ExecutionError::EnvFile {
                path: path.to_path_buf(),
                line: e.line,
                column: e.column,
                detail: e.detail,
            })?
        } else {
            ui.warn(&format!("Envfile '{}' could not be found", path.display()));
            Vec::new()
        };

        let entries = Arc::new(entries);
        self.files.insert(path.to_path_buf(), Arc::clone(&entries));
        Ok(entries)
    }
}

/// Resolves an `envfile` option value to an absolute path: templates expand
/// first, then a leading `~`, and relative paths anchor at the project root.
pub fn resolve_path(raw: &str, env: &EnvVarsManager, project_dir: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(&env.expand(raw)).into_owned();
    let path = Path::new(&expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

// --- Parser ---

#[derive(Debug, PartialEq, Eq)]
pub struct EnvFileParseError {
    pub line: usize,
    pub column: usize,
    pub detail: String,
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            chars: content.chars().peekable(),
            line: 1,
            column: 0,
        }
    }

    fn next(&mut self) -> Option<char> {
        let c = self.chars.next();
        match c {
            Some('\n') => {
                self.line += 1;
                self.column = 0;
            }
            Some(_) => self.column += 1,
            None => {}
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn error(&self, detail: impl Into<String>) -> EnvFileParseError {
        EnvFileParseError {
            line: self.line,
            column: self.column,
            detail: detail.into(),
        }
    }

    fn error_at(&self, line: usize, column: usize, detail: impl Into<String>) -> EnvFileParseError {
        EnvFileParseError {
            line,
            column,
            detail: detail.into(),
        }
    }
}

/// Parses envfile content into assignment pairs, preserving file order.
pub fn parse(content: &str) -> Result<Vec<(String, String)>, EnvFileParseError> {
    let mut cur = Cursor::new(content);
    let mut entries = Vec::new();

    loop {
        skip_separators(&mut cur);
        if cur.peek().is_none() {
            return Ok(entries);
        }
        let key = read_key(&mut cur)?;
        let value = read_value(&mut cur)?;
        entries.push((key, value));
    }
}

/// Consumes whitespace, `;` separators, and `#` comments between
/// assignments.
fn skip_separators(cur: &mut Cursor<'_>) {
    while let Some(c) = cur.peek() {
        if c.is_whitespace() || c == ';' {
            cur.next();
        } else if c == '#' {
            while let Some(c) = cur.peek() {
                if c == '\n' {
                    break;
                }
                cur.next();
            }
        } else {
            break;
        }
    }
}

/// Reads `NAME=` or `export NAME=`, consuming the `=`. Returns the validated
/// name.
fn read_key(cur: &mut Cursor<'_>) -> Result<String, EnvFileParseError> {
    let mut word = read_word(cur);

    match cur.peek() {
        Some('=') => {
            cur.next();
        }
        Some(c) if c == ' ' || c == '\t' => {
            if word != "export" {
                return Err(cur.error(format!("expected '=' after '{word}'")));
            }
            while matches!(cur.peek(), Some(' ' | '\t')) {
                cur.next();
            }
            word = read_word(cur);
            if cur.peek() == Some('=') {
                cur.next();
            } else {
                return Err(cur.error(format!("expected '=' after '{word}'")));
            }
        }
        _ => return Err(cur.error(format!("expected '=' after '{word}'"))),
    }

    if !crate::core::template::is_valid_identifier(&word) {
        return Err(cur.error(format!("invalid variable name '{word}'")));
    }
    Ok(word)
}

fn read_word(cur: &mut Cursor<'_>) -> String {
    let mut word = String::new();
    while let Some(c) = cur.peek() {
        if c.is_whitespace() || c == '=' || c == ';' {
            break;
        }
        word.push(c);
        cur.next();
    }
    word
}

/// Reads a value: a concatenation of unquoted, single-quoted, and
/// double-quoted segments, ended by unescaped whitespace, `;`, or EOF.
fn read_value(cur: &mut Cursor<'_>) -> Result<String, EnvFileParseError> {
    let mut value = String::new();
    loop {
        match cur.peek() {
            None => return Ok(value),
            Some(c) if c.is_whitespace() || c == ';' => return Ok(value),
            Some('\'') => {
                let (line, column) = (cur.line, cur.column + 1);
                cur.next();
                read_single_quoted(cur, &mut value, line, column)?;
            }
            Some('"') => {
                let (line, column) = (cur.line, cur.column + 1);
                cur.next();
                read_double_quoted(cur, &mut value, line, column)?;
            }
            Some('\\') => {
                cur.next();
                match cur.next() {
                    // Backslash-newline joins lines; both characters vanish.
                    Some('\n') => {}
                    Some(c) => value.push(c),
                    None => return Err(cur.error("dangling '\\' at end of file")),
                }
            }
            Some(c) => {
                value.push(c);
                cur.next();
            }
        }
    }
}

/// Single quotes: everything literal, no escapes, until the closing quote.
fn read_single_quoted(
    cur: &mut Cursor<'_>,
    value: &mut String,
    open_line: usize,
    open_column: usize,
) -> Result<(), EnvFileParseError> {
    loop {
        match cur.next() {
            None => return Err(cur.error_at(open_line, open_column, "unmatched single quote")),
            Some('\'') => return Ok(()),
            Some(c) => value.push(c),
        }
    }
}

/// Double quotes: `\"`, `\$` and `\\` produce the escaped character; any
/// other backslash is kept verbatim.
fn read_double_quoted(
    cur: &mut Cursor<'_>,
    value: &mut String,
    open_line: usize,
    open_column: usize,
) -> Result<(), EnvFileParseError> {
    loop {
        match cur.next() {
            None => return Err(cur.error_at(open_line, open_column, "unmatched double quote")),
            Some('"') => return Ok(()),
            Some('\\') => match cur.peek() {
                Some('"' | '$' | '\\') => {
                    value.push(cur.next().unwrap_or_default());
                }
                _ => value.push('\\'),
            },
            Some(c) => value.push(c),
        }
    }
}

// MARK: --- UNIT TESTS ---
