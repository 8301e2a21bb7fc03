//! Tokenizer for cmd task content.
//!
//! The content is parsed into a small AST first (lines of words, words of
//! quoted/unquoted segments, segments of text / parameter-expansion / glob
//! atoms) and resolved against an environment afterwards, so the quoting
//! analysis never has to re-run on expanded values. The dialect is a
//! deliberate POSIX subset: quoting, backslash escapes, `$VAR` / `${VAR}`
//! expansion with word splitting, and `*` / `?` / `[…]` filesystem globs.
//! There is no command substitution, no pipes, and no redirection; command
//! lines are handed to the OS directly, not to a shell.

use crate::errors::{ParseError, PoeResult};
use glob::Pattern;
use std::collections::HashMap;
use std::path::Path;

// --- AST ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    /// Literal text.
    Text(String),
    /// A `$NAME` or `${NAME}` parameter expansion.
    Param(String),
    /// A glob atom: `*`, `?`, or a bracket class, active at resolution time.
    Glob(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Bare text; params expand with word splitting, glob atoms are active.
    Unquoted(Vec<Atom>),
    /// Everything literal, including `$`.
    SingleQuoted(String),
    /// Params expand without splitting; no glob atoms.
    DoubleQuoted(Vec<Atom>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub words: Vec<Word>,
}

// --- Parser ---

struct Parser {
    chars: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            column: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.index).copied();
        if let Some(c) = c {
            self.index += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
        }
        c
    }

    /// Position of the next unconsumed character, for error reports.
    fn next_pos(&self) -> (usize, usize) {
        (self.line, self.column + 1)
    }
}

/// Accumulates the word currently being parsed.
#[derive(Default)]
struct WordBuilder {
    segments: Vec<Segment>,
    atoms: Vec<Atom>,
    text: String,
}

impl WordBuilder {
    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.atoms.push(Atom::Text(std::mem::take(&mut self.text)));
        }
    }

    fn flush_unquoted(&mut self) {
        self.flush_text();
        if !self.atoms.is_empty() {
            self.segments
                .push(Segment::Unquoted(std::mem::take(&mut self.atoms)));
        }
    }

    fn push_segment(&mut self, segment: Segment) {
        self.flush_unquoted();
        self.segments.push(segment);
    }

    fn push_atom(&mut self, atom: Atom) {
        self.flush_text();
        self.atoms.push(atom);
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.atoms.is_empty() && self.text.is_empty()
    }

    fn take_word(&mut self) -> Option<Word> {
        self.flush_unquoted();
        if self.segments.is_empty() {
            None
        } else {
            Some(Word {
                segments: std::mem::take(&mut self.segments),
            })
        }
    }
}

/// Parses command content into lines. Empty lines (blank, or comment-only)
/// are dropped.
pub fn parse_script(source: &str) -> Result<Vec<Line>, ParseError> {
    let mut parser = Parser::new(source);
    let mut lines: Vec<Line> = Vec::new();
    let mut words: Vec<Word> = Vec::new();
    let mut word = WordBuilder::default();

    macro_rules! end_word {
        () => {
            if let Some(w) = word.take_word() {
                words.push(w);
            }
        };
    }
    macro_rules! end_line {
        () => {
            end_word!();
            if !words.is_empty() {
                lines.push(Line {
                    words: std::mem::take(&mut words),
                });
            }
        };
    }

    while let Some(c) = parser.peek() {
        match c {
            '\n' | '\r' | ';' => {
                parser.advance();
                end_line!();
            }
            ' ' | '\t' => {
                parser.advance();
                end_word!();
            }
            '#' if word.is_empty() => {
                // Comment runs to end of line; the newline itself is handled
                // by the next iteration.
                while let Some(c) = parser.peek() {
                    if c == '\n' {
                        break;
                    }
                    parser.advance();
                }
            }
            '\\' => {
                parser.advance();
                match parser.advance() {
                    None => return Err(ParseError::TrailingBackslash),
                    // Backslash-newline is a line continuation.
                    Some('\n') => {}
                    Some(escaped) => word.text.push(escaped),
                }
            }
            '\'' => {
                let (line, column) = parser.next_pos();
                parser.advance();
                let content = parse_single_quoted(&mut parser, line, column)?;
                word.push_segment(Segment::SingleQuoted(content));
            }
            '"' => {
                let (line, column) = parser.next_pos();
                parser.advance();
                let atoms = parse_double_quoted(&mut parser, line, column)?;
                word.push_segment(Segment::DoubleQuoted(atoms));
            }
            '$' => {
                parser.advance();
                match parse_param(&mut parser)? {
                    Some(name) => word.push_atom(Atom::Param(name)),
                    None => word.text.push('$'),
                }
            }
            '*' | '?' => {
                parser.advance();
                word.push_atom(Atom::Glob(c.to_string()));
            }
            '[' => {
                if let Some(end) = scan_bracket_class(&parser.chars, parser.index) {
                    let class: String = parser.chars[parser.index..end].iter().collect();
                    while parser.index < end {
                        parser.advance();
                    }
                    word.push_atom(Atom::Glob(class));
                } else {
                    parser.advance();
                    word.text.push('[');
                }
            }
            _ => {
                parser.advance();
                word.text.push(c);
            }
        }
    }

    end_line!();
    Ok(lines)
}

fn parse_single_quoted(
    parser: &mut Parser,
    open_line: usize,
    open_column: usize,
) -> Result<String, ParseError> {
    let mut content = String::new();
    loop {
        match parser.advance() {
            None => {
                return Err(ParseError::UnmatchedQuote {
                    quote: '\'',
                    line: open_line,
                    column: open_column,
                });
            }
            Some('\'') => return Ok(content),
            Some(c) => content.push(c),
        }
    }
}

fn parse_double_quoted(
    parser: &mut Parser,
    open_line: usize,
    open_column: usize,
) -> Result<Vec<Atom>, ParseError> {
    let mut atoms = Vec::new();
    let mut text = String::new();
    macro_rules! flush {
        () => {
            if !text.is_empty() {
                atoms.push(Atom::Text(std::mem::take(&mut text)));
            }
        };
    }

    loop {
        match parser.advance() {
            None => {
                return Err(ParseError::UnmatchedQuote {
                    quote: '"',
                    line: open_line,
                    column: open_column,
                });
            }
            Some('"') => {
                flush!();
                return Ok(atoms);
            }
            Some('\\') => match parser.peek() {
                Some('"' | '$' | '\\') => {
                    if let Some(escaped) = parser.advance() {
                        text.push(escaped);
                    }
                }
                // Any other backslash is preserved verbatim.
                _ => text.push('\\'),
            },
            Some('$') => match parse_param(parser)? {
                Some(name) => {
                    flush!();
                    atoms.push(Atom::Param(name));
                }
                None => text.push('$'),
            },
            Some(c) => text.push(c),
        }
    }
}

/// Parses the remainder of a parameter expansion, the `$` already consumed.
/// Returns `None` when the `$` is not followed by a name (it stays literal).
fn parse_param(parser: &mut Parser) -> Result<Option<String>, ParseError> {
    match parser.peek() {
        Some('{') => {
            let (line, column) = parser.next_pos();
            parser.advance();
            let mut name = String::new();
            loop {
                match parser.advance() {
                    None => {
                        return Err(ParseError::BadSubstitution {
                            line,
                            column,
                            detail: "unterminated ${".to_string(),
                        });
                    }
                    Some('}') => break,
                    Some(c) => name.push(c),
                }
            }
            if crate::core::template::is_valid_identifier(&name) {
                Ok(Some(name))
            } else {
                Err(ParseError::BadSubstitution {
                    line,
                    column,
                    detail: format!("'{name}' is not a valid parameter name"),
                })
            }
        }
        Some(c) if crate::core::template::is_name_start(c) => {
            let mut name = String::new();
            while let Some(c) = parser.peek() {
                if !crate::core::template::is_name_char(c) {
                    break;
                }
                name.push(c);
                parser.advance();
            }
            Ok(Some(name))
        }
        _ => Ok(None),
    }
}

/// Validates a bracket class starting at `chars[start] == '['`. Returns the
/// index one past the closing `]`, or `None` when the text does not form a
/// class (and must be taken literally). The set may not be empty, may not
/// contain `[` or a newline, and whitespace inside it is allowed.
fn scan_bracket_class(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'!') {
        i += 1;
    }
    let set_start = i;
    while let Some(&c) = chars.get(i) {
        match c {
            ']' => return (i > set_start).then_some(i + 1),
            '[' | '\n' => return None,
            _ => i += 1,
        }
    }
    None
}

// --- Resolution ---

/// A token after parameter expansion and word splitting, before glob
/// expansion. Parts flagged as globs stay active; everything else matches
/// literally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedToken {
    parts: Vec<(String, bool)>,
    quoted: bool,
}

impl ResolvedToken {
    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.parts.last_mut() {
            Some((last, false)) => last.push_str(text),
            _ => self.parts.push((text.to_string(), false)),
        }
    }

    fn push_glob(&mut self, glob: &str) {
        self.parts.push((glob.to_string(), true));
    }

    fn is_empty(&self) -> bool {
        self.parts.is_empty() && !self.quoted
    }

    pub fn has_glob(&self) -> bool {
        self.parts.iter().any(|(_, glob)| *glob)
    }

    /// The token verbatim, globs unexpanded.
    pub fn text(&self) -> String {
        self.parts.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// The token as a glob pattern: literal parts escaped, glob parts raw.
    pub fn pattern(&self) -> String {
        self.parts
            .iter()
            .map(|(s, glob)| {
                if *glob {
                    s.clone()
                } else {
                    Pattern::escape(s)
                }
            })
            .collect()
    }
}

/// Expands one parsed line into tokens: parameters substituted, unquoted
/// expansions word-split, glob atoms marked active (including those arriving
/// through an unquoted expansion).
pub fn resolve_line(line: &Line, env: &HashMap<String, String>) -> Vec<ResolvedToken> {
    let mut tokens = Vec::new();

    fn finalize(current: &mut ResolvedToken, tokens: &mut Vec<ResolvedToken>) {
        let token = std::mem::take(current);
        if !token.is_empty() {
            tokens.push(token);
        }
    }

    for word in &line.words {
        let mut current = ResolvedToken::default();

        for segment in &word.segments {
            match segment {
                Segment::SingleQuoted(text) => {
                    current.quoted = true;
                    current.push_text(text);
                }
                Segment::DoubleQuoted(atoms) => {
                    current.quoted = true;
                    for atom in atoms {
                        match atom {
                            Atom::Text(t) => current.push_text(t),
                            Atom::Param(name) => {
                                current.push_text(env.get(name).map_or("", String::as_str));
                            }
                            Atom::Glob(g) => current.push_text(g),
                        }
                    }
                }
                Segment::Unquoted(atoms) => {
                    for atom in atoms {
                        match atom {
                            Atom::Text(t) => current.push_text(t),
                            Atom::Glob(g) => current.push_glob(g),
                            Atom::Param(name) => {
                                let value = env.get(name).map_or("", String::as_str);
                                let leading = value.starts_with(char::is_whitespace);
                                let trailing = value.ends_with(char::is_whitespace);
                                let pieces: Vec<&str> = value.split_whitespace().collect();

                                if leading {
                                    finalize(&mut current, &mut tokens);
                                }
                                for (i, piece) in pieces.iter().enumerate() {
                                    if i > 0 {
                                        finalize(&mut current, &mut tokens);
                                    }
                                    push_expanded(&mut current, piece);
                                }
                                if trailing {
                                    finalize(&mut current, &mut tokens);
                                }
                            }
                        }
                    }
                }
            }
        }

        finalize(&mut current, &mut tokens);
    }

    tokens
}

/// Appends expanded parameter text to a token. Glob atoms inside the value
/// become active; nothing else (quotes, `$`, escapes) is reinterpreted.
fn push_expanded(token: &mut ResolvedToken, value: &str) {
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' | '?' => {
                token.push_glob(&chars[i].to_string());
                i += 1;
            }
            '[' => {
                if let Some(end) = scan_bracket_class(&chars, i) {
                    let class: String = chars[i..end].iter().collect();
                    token.push_glob(&class);
                    i = end;
                } else {
                    token.push_text("[");
                    i += 1;
                }
            }
            c => {
                token.push_text(&c.to_string());
                i += 1;
            }
        }
    }
}

/// Resolves cmd task content to an argv: parse, expand, word-split, then
/// glob against `cwd`. A glob that matches nothing drops its token.
pub fn resolve_command(
    source: &str,
    env: &HashMap<String, String>,
    cwd: &Path,
) -> PoeResult<Vec<String>> {
    let lines = parse_script(source)?;
    let line = match lines.len() {
        0 => return Ok(Vec::new()),
        1 => &lines[0],
        found => return Err(ParseError::MultipleCommands { found }.into()),
    };

    let mut argv = Vec::new();
    for token in resolve_line(line, env) {
        if token.has_glob() {
            argv.extend(expand_glob(&token, cwd)?);
        } else {
            argv.push(token.text());
        }
    }
    Ok(argv)
}

fn expand_glob(token: &ResolvedToken, cwd: &Path) -> PoeResult<Vec<String>> {
    let pattern = token.pattern();
    let rooted = Path::new(&pattern).is_absolute();
    let cwd_display = dunce::simplified(cwd).display().to_string();
    let full_pattern = if rooted {
        pattern.clone()
    } else {
        format!("{}/{}", Pattern::escape(&cwd_display), pattern)
    };

    let walker = glob::glob(&full_pattern).map_err(|e| ParseError::Glob {
        pattern: token.text(),
        detail: e.msg.to_string(),
    })?;

    let mut matches = Vec::new();
    for entry in walker {
        // Unreadable directories are skipped, as a shell would.
        let Ok(path) = entry else { continue };
        let rendered = if rooted {
            path.display().to_string()
        } else {
            path.strip_prefix(cwd)
                .unwrap_or(&path)
                .display()
                .to_string()
        };
        matches.push(rendered);
    }
    matches.sort();
    log::trace!(
        "glob '{}' matched {} path(s) under {}",
        token.text(),
        matches.len(),
        cwd_display
    );
    Ok(matches)
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolve(source: &str, pairs: &[(&str, &str)]) -> Vec<String> {
        let lines = parse_script(source).expect("source should parse");
        assert_eq!(lines.len(), 1, "expected a single line");
        resolve_line(&lines[0], &env(pairs))
            .iter()
            .map(ResolvedToken::text)
            .collect()
    }

    #[test]
    fn test_simple_words() {
        assert_eq!(resolve("echo hello world", &[]), ["echo", "hello", "world"]);
        assert_eq!(resolve("  spaced\tout  ", &[]), ["spaced", "out"]);
    }

    #[test]
    fn test_quote_round_trip() {
        // Single-quoting plain tokens and joining resolves back to them.
        let tokens = ["a", "b_c", "d/e.f", "g-1"];
        let source = tokens
            .iter()
            .map(|t| format!("'{t}'"))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(resolve(&source, &[]), tokens);
    }

    #[test]
    fn test_quotes_join_within_word() {
        assert_eq!(resolve(r#"a'b'"c"d"#, &[]), ["abcd"]);
        assert_eq!(resolve("''", &[]), [""]);
    }

    #[test]
    fn test_single_quotes_are_literal() {
        assert_eq!(resolve("'$x *'", &[("x", "1")]), ["$x *"]);
    }

    #[test]
    fn test_unquoted_expansion_word_splits() {
        assert_eq!(
            resolve("echo $x", &[("x", "a b c")]),
            ["echo", "a", "b", "c"]
        );
        assert_eq!(resolve("echo $x", &[("x", " a  b ")]), ["echo", "a", "b"]);
        assert_eq!(resolve("pre$x", &[("x", "fix rest")]), ["prefix", "rest"]);
        assert_eq!(resolve("a$x", &[("x", " b")]), ["a", "b"]);
    }

    #[test]
    fn test_double_quoted_expansion_does_not_split() {
        assert_eq!(resolve(r#"echo "$x""#, &[("x", "a b c")]), ["echo", "a b c"]);
        assert_eq!(resolve(r#"echo "${x}!""#, &[("x", "hi")]), ["echo", "hi!"]);
    }

    #[test]
    fn test_empty_expansions() {
        // An unquoted empty expansion vanishes; a quoted one stays.
        assert_eq!(resolve("echo $gone", &[]), ["echo"]);
        assert_eq!(resolve(r#"echo "$gone""#, &[]), ["echo", ""]);
    }

    #[test]
    fn test_escapes_outside_quotes() {
        assert_eq!(resolve(r"a\ b", &[]), ["a b"]);
        assert_eq!(resolve(r"\$x", &[("x", "1")]), ["$x"]);
        assert_eq!(resolve(r"star\*", &[]), ["star*"]);
    }

    #[test]
    fn test_escapes_inside_double_quotes() {
        assert_eq!(resolve(r#""say \"hi\"""#, &[]), [r#"say "hi""#]);
        assert_eq!(resolve(r#""\$x""#, &[("x", "1")]), ["$x"]);
        assert_eq!(resolve(r#""back\\slash""#, &[]), [r"back\slash"]);
        assert_eq!(resolve(r#""keep\other""#, &[]), [r"keep\other"]);
    }

    #[test]
    fn test_dollar_without_name_is_literal() {
        assert_eq!(resolve("cost$ now", &[]), ["cost$", "now"]);
        assert_eq!(resolve("$1du", &[]), ["$1du"]);
    }

    #[test]
    fn test_comments() {
        let lines = parse_script("echo one # a trailing comment\n# whole line\necho two").unwrap();
        assert_eq!(lines.len(), 2);
        // A hash inside a word stays literal.
        assert_eq!(resolve("wget http://x/#frag", &[]), ["wget", "http://x/#frag"]);
    }

    #[test]
    fn test_line_separators() {
        let lines = parse_script("echo a; echo b\necho c").unwrap();
        assert_eq!(lines.len(), 3);
        let continued = parse_script("echo a \\\n b").unwrap();
        assert_eq!(continued.len(), 1);
        assert_eq!(continued[0].words.len(), 3);
    }

    #[test]
    fn test_unmatched_quote_errors() {
        assert!(matches!(
            parse_script("echo 'oops").unwrap_err(),
            ParseError::UnmatchedQuote { quote: '\'', .. }
        ));
        assert!(matches!(
            parse_script(r#"echo "oops"#).unwrap_err(),
            ParseError::UnmatchedQuote { quote: '"', .. }
        ));
    }

    #[test]
    fn test_trailing_backslash_errors() {
        assert!(matches!(
            parse_script("echo oops\\").unwrap_err(),
            ParseError::TrailingBackslash
        ));
    }

    #[test]
    fn test_bad_substitution_errors() {
        assert!(matches!(
            parse_script("echo ${not valid}").unwrap_err(),
            ParseError::BadSubstitution { .. }
        ));
        assert!(matches!(
            parse_script("echo ${unclosed").unwrap_err(),
            ParseError::BadSubstitution { .. }
        ));
    }

    #[test]
    fn test_bracket_classes() {
        let lines = parse_script("ls [abc]?.rs").unwrap();
        let word = &lines[0].words[1];
        assert_eq!(
            word.segments,
            vec![Segment::Unquoted(vec![
                Atom::Glob("[abc]".to_string()),
                Atom::Glob("?".to_string()),
                Atom::Text(".rs".to_string()),
            ])]
        );
        // Malformed classes fall back to literal text.
        let lines = parse_script("ls a[").unwrap();
        assert_eq!(
            lines[0].words[1].segments,
            vec![Segment::Unquoted(vec![Atom::Text("a[".to_string())])]
        );
        let lines = parse_script("ls [] x").unwrap();
        assert_eq!(lines[0].words.len(), 3);
    }

    #[test]
    fn test_class_may_contain_whitespace() {
        let lines = parse_script("grep [a b]").unwrap();
        assert_eq!(lines[0].words.len(), 2);
        assert_eq!(
            lines[0].words[1].segments,
            vec![Segment::Unquoted(vec![Atom::Glob("[a b]".to_string())])]
        );
    }

    #[test]
    fn test_glob_atoms_in_expansion_are_active() {
        let lines = parse_script("ls $pat").unwrap();
        let tokens = resolve_line(&lines[0], &env(&[("pat", "*.rs")]));
        assert!(tokens[1].has_glob());
        // But a quoted expansion keeps them inert.
        let lines = parse_script(r#"ls "$pat""#).unwrap();
        let tokens = resolve_line(&lines[0], &env(&[("pat", "*.rs")]));
        assert!(!tokens[1].has_glob());
    }

    #[test]
    fn test_pattern_escapes_literal_parts() {
        let lines = parse_script("cp [ab]*literal[x] dest").unwrap();
        let tokens = resolve_line(&lines[0], &env(&[]));
        let pattern = tokens[1].pattern();
        assert!(pattern.starts_with("[ab]*"));
        // The literal tail contains a valid-looking class of its own, which
        // parses as a glob atom too; only genuinely literal text is escaped.
        assert!(tokens[1].has_glob());
        let quoted = resolve(r#"cp '[ab]raw' dest"#, &[]);
        assert_eq!(quoted[1], "[ab]raw");
    }

    #[test]
    fn test_resolve_command_globs_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "").unwrap();
        std::fs::write(dir.path().join("two.txt"), "").unwrap();
        std::fs::write(dir.path().join("other.rs"), "").unwrap();

        let argv = resolve_command("cat *.txt", &env(&[]), dir.path()).unwrap();
        assert_eq!(argv, ["cat", "one.txt", "two.txt"]);
    }

    #[test]
    fn test_resolve_command_drops_unmatched_glob() {
        let dir = tempfile::tempdir().unwrap();
        let argv = resolve_command("ls *.nope trailing", &env(&[]), dir.path()).unwrap();
        assert_eq!(argv, ["ls", "trailing"]);
    }

    #[test]
    fn test_resolve_command_quoted_glob_is_literal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let argv = resolve_command(r#"ls "*.txt""#, &env(&[]), dir.path()).unwrap();
        assert_eq!(argv, ["ls", "*.txt"]);
    }

    #[test]
    fn test_resolve_command_rejects_multiple_commands() {
        let err = resolve_command("echo a; echo b", &env(&[]), Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("exactly one command"));
    }

    #[test]
    fn test_variable_and_glob_combination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let argv = resolve_command(
            "echo $greeting *.md",
            &env(&[("greeting", "hi there")]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(argv, ["echo", "hi", "there", "README.md"]);
    }
}
