//! `$VAR` / `${VAR}` expansion against a variable mapping.
//!
//! A `$` preceded by an odd number of backslashes is escaped: the innermost
//! backslash is removed and the reference is emitted literally. Unknown
//! variables expand to the empty string. In `require_braces` mode only the
//! `${VAR}` form is substituted, which protects command content that
//! legitimately contains bare `$word` text (env-table values are expanded in
//! this mode before the command parser ever sees them).

use std::collections::HashMap;

pub fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// True for names matching `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_name_start(first) => chars.all(is_name_char),
        _ => false,
    }
}

/// Expands every unescaped variable reference in `template`.
pub fn expand(template: &str, vars: &HashMap<String, String>, require_braces: bool) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '\\' {
            // Measure the backslash run and check what it precedes.
            let mut run = 0;
            while i + run < chars.len() && chars[i + run] == '\\' {
                run += 1;
            }
            let next = chars.get(i + run).copied();
            if next == Some('$') && run % 2 == 1 {
                // Escaped reference: drop one backslash, keep the `$` literal.
                out.extend(std::iter::repeat_n('\\', run - 1));
                out.push('$');
                i += run + 1;
            } else {
                out.extend(std::iter::repeat_n('\\', run));
                i += run;
            }
            continue;
        }

        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        // At an unescaped `$`.
        match chars.get(i + 1) {
            Some('{') => {
                if let Some((name, end)) = scan_braced_name(&chars, i + 2) {
                    out.push_str(vars.get(&name).map_or("", String::as_str));
                    i = end;
                } else {
                    // Not a well-formed `${NAME}`; leave the text alone.
                    out.push('$');
                    i += 1;
                }
            }
            Some(&c) if !require_braces && is_name_start(c) => {
                let mut end = i + 1;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[i + 1..end].iter().collect();
                out.push_str(vars.get(&name).map_or("", String::as_str));
                i = end;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }

    out
}

/// Scans a `NAME}` starting at `start` (just past `${`). Returns the name and
/// the index one past the closing brace.
fn scan_braced_name(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut end = start;
    while end < chars.len() && chars[end] != '}' {
        end += 1;
    }
    if end >= chars.len() {
        return None;
    }
    let name: String = chars[start..end].iter().collect();
    if is_valid_identifier(&name) {
        Some((name, end + 1))
    } else {
        None
    }
}

// MARK: --- UNIT TESTS ---
