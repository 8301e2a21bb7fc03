//! Layered task environments.
//!
//! Layer order, outermost first: process environment, global `env` /
//! `envfile`, task `envfile`, task `env`, captured `uses` outputs, named
//! argument bindings. Extending never mutates the parent: a child layer
//! starts from a copy of the parent's flattened view, so sibling tasks see
//! identical environments no matter what previous siblings did.

use crate::constants;
use crate::core::template;
use crate::models::EnvValue;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct EnvVarsManager {
    vars: HashMap<String, String>,
}

impl EnvVarsManager {
    /// Root layer: the process environment plus the reserved keys. An
    /// inherited `POE_PWD` is preserved so nested invocations keep reporting
    /// the directory the user originally ran from.
    pub fn from_process(project_dir: &Path, invocation_cwd: &Path) -> Self {
        let mut manager = Self {
            vars: std::env::vars().collect(),
        };
        manager.set(
            constants::ENV_POE_ROOT,
            &project_dir.display().to_string(),
        );
        manager.set_default(
            constants::ENV_POE_PWD,
            &invocation_cwd.display().to_string(),
        );
        manager
    }

    /// Builds a layer from an explicit base mapping. Used by tests and by
    /// anything that must not read the ambient process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// A fresh child layer seeded with this layer's contents.
    pub fn extended(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Sets `key` only when it is still unset.
    pub fn set_default(&mut self, key: &str, value: &str) {
        if !self.vars.contains_key(key) {
            self.set(key, value);
        }
    }

    /// Applies one `env` table entry. Values are themselves templates and
    /// are expanded (braced form only) against the in-progress mapping, so
    /// an entry can reference keys from outer layers or earlier entries.
    pub fn apply(&mut self, key: &str, value: &EnvValue) {
        match value {
            EnvValue::Literal(raw) => {
                let expanded = template::expand(raw, &self.vars, true);
                self.set(key, &expanded);
            }
            EnvValue::Defaulted(raw) => {
                if !self.contains(key) {
                    let expanded = template::expand(raw, &self.vars, true);
                    self.set(key, &expanded);
                }
            }
        }
    }

    /// Applies parsed envfile assignments, in file order. Envfile values are
    /// taken literally.
    pub fn apply_file_entries(&mut self, entries: &[(String, String)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    /// Expands a template against this layer, both `$VAR` and `${VAR}`
    /// forms. Used for `cwd`, capture paths, arg defaults, and ref tokens.
    pub fn expand(&self, raw: &str) -> String {
        template::expand(raw, &self.vars, false)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Flat mapping handed to the spawned process.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars.clone()
    }
}

// MARK: --- UNIT TESTS ---

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EnvVarsManager {
        let mut vars = HashMap::new();
        vars.insert("GLOBAL".to_string(), "g".to_string());
        vars.insert("SHADOWED".to_string(), "outer".to_string());
        EnvVarsManager::from_map(vars)
    }

    #[test]
    fn test_extend_does_not_mutate_parent() {
        let parent = base();
        let mut child = parent.extended();
        child.set("SHADOWED", "inner");
        child.set("NEW", "n");

        assert_eq!(parent.get("SHADOWED"), Some("outer"));
        assert!(!parent.contains("NEW"));
        assert_eq!(child.get("SHADOWED"), Some("inner"));
        assert_eq!(child.get("GLOBAL"), Some("g"));
    }

    #[test]
    fn test_apply_expands_against_outer_layers() {
        let mut env = base();
        env.apply("DERIVED", &EnvValue::Literal("${GLOBAL}/sub".to_string()));
        assert_eq!(env.get("DERIVED"), Some("g/sub"));
    }

    #[test]
    fn test_apply_sees_earlier_entries_of_same_block() {
        let mut env = base();
        env.apply("A", &EnvValue::Literal("1".to_string()));
        env.apply("B", &EnvValue::Literal("${A}2".to_string()));
        assert_eq!(env.get("B"), Some("12"));
    }

    #[test]
    fn test_apply_braced_only() {
        let mut env = base();
        env.apply("RAW", &EnvValue::Literal("$GLOBAL stays".to_string()));
        assert_eq!(env.get("RAW"), Some("$GLOBAL stays"));
    }

    #[test]
    fn test_defaulted_respects_existing_value() {
        let mut env = base();
        env.apply("SHADOWED", &EnvValue::Defaulted("fallback".to_string()));
        env.apply("FRESH", &EnvValue::Defaulted("fallback".to_string()));
        assert_eq!(env.get("SHADOWED"), Some("outer"));
        assert_eq!(env.get("FRESH"), Some("fallback"));
    }

    #[test]
    fn test_file_entries_are_literal() {
        let mut env = base();
        env.apply_file_entries(&[("FROM_FILE".to_string(), "${GLOBAL}".to_string())]);
        assert_eq!(env.get("FROM_FILE"), Some("${GLOBAL}"));
    }

    #[test]
    fn test_layer_precedence() {
        // Global -> task env -> uses output -> named args, later wins.
        let mut env = base();
        env.apply("KEY", &EnvValue::Literal("task".to_string()));
        env.set("KEY", "uses");
        env.set("KEY", "args");
        assert_eq!(env.get("KEY"), Some("args"));
    }

    #[test]
    fn test_to_map_is_a_snapshot() {
        let mut env = base();
        let snapshot = env.to_map();
        env.set("GLOBAL", "changed");
        assert_eq!(snapshot.get("GLOBAL").map(String::as_str), Some("g"));
    }
}
