// src/ui.rs

use colored::Colorize;

/// How an action line is introduced. Captured tasks and dry-run lines with
/// still-unknown inputs are marked differently so scripted output inspection
/// can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStyle {
    /// A task about to run with inherited stdout.
    Run,
    /// A task whose stdout is being captured for later use.
    Capture,
    /// A dry-run line whose inputs depend on tasks that were not executed.
    Unresolved,
}

impl ActionStyle {
    fn marker(self) -> &'static str {
        match self {
            Self::Run => "poe =>",
            Self::Capture => "poe <=",
            Self::Unresolved => "poe ??",
        }
    }
}

/// Verbosity-gated writer for everything the runner itself says.
///
/// All runner chatter goes to stderr so that task stdout stays clean for
/// capture and piping. Verbosity ranges from -1 (quiet: errors only) to 2
/// (debug: echo resolved environments).
#[derive(Debug, Clone)]
pub struct Ui {
    verbosity: i64,
}

impl Ui {
    pub fn new(verbosity: i64) -> Self {
        Self {
            verbosity: verbosity.clamp(-1, 2),
        }
    }

    /// Applies `--ansi` / `--no-ansi`. Must run before any colored output.
    pub fn apply_ansi_override(force: Option<bool>) {
        if let Some(enabled) = force {
            colored::control::set_override(enabled);
        }
    }

    pub fn verbosity(&self) -> i64 {
        self.verbosity
    }

    /// Announces a task or command about to run (or dry-run).
    pub fn action(&self, style: ActionStyle, text: &str) {
        if self.verbosity >= 0 {
            eprintln!("{} {}", style.marker().cyan().bold(), text.bold());
        }
    }

    /// Blank separator line between tasks of a multi-task run.
    pub fn separator(&self) {
        if self.verbosity >= 0 {
            eprintln!();
        }
    }

    pub fn warn(&self, message: &str) {
        if self.verbosity >= 0 {
            eprintln!("{}: {}", "Warning".yellow().bold(), message);
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}: {}", "Error".red().bold(), message);
    }

    /// Extra diagnostics shown only at `-v -v`.
    pub fn debug(&self, message: &str) {
        if self.verbosity >= 2 {
            eprintln!("{}", message.dimmed());
        }
    }

    /// Unconditional line on stdout, used by the help screen and `--version`.
    pub fn output(&self, message: &str) {
        println!("{message}");
    }
}

impl Default for Ui {
    fn default() -> Self {
        Self::new(0)
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_is_clamped() {
        assert_eq!(Ui::new(9).verbosity(), 2);
        assert_eq!(Ui::new(-9).verbosity(), -1);
        assert_eq!(Ui::new(1).verbosity(), 1);
    }

    #[test]
    fn test_markers_are_distinct() {
        let all = [
            ActionStyle::Run.marker(),
            ActionStyle::Capture.marker(),
            ActionStyle::Unresolved.marker(),
        ];
        assert_eq!(
            all.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }
}
