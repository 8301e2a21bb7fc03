// src/constants.rs

/// The default configuration file searched for when walking up from the cwd.
pub const PYPROJECT_FILENAME: &str = "pyproject.toml";

/// Dedicated tasks file (TOML form); its options live at the document root.
pub const TASKS_FILENAME_TOML: &str = "poe_tasks.toml";

/// Dedicated tasks file (JSON form).
pub const TASKS_FILENAME_JSON: &str = "poe_tasks.json";

/// Table path of the runner's options inside `pyproject.toml`.
pub const CONFIG_NAMESPACE: &[&str] = &["tool", "poe"];

/// Reserved variable: absolute path of the project directory.
pub const ENV_POE_ROOT: &str = "POE_ROOT";

/// Reserved variable: the user's working directory when the run started.
pub const ENV_POE_PWD: &str = "POE_PWD";

/// Reserved variable: name of the executor type, set just before spawning.
pub const ENV_POE_ACTIVE: &str = "POE_ACTIVE";

/// Reserved variable: directory of the document that defined the task.
pub const ENV_POE_CONF_DIR: &str = "POE_CONF_DIR";

/// Task type used when a task is configured as a bare string.
pub const DEFAULT_TASK_TYPE: &str = "cmd";

/// Task type used when a task is configured as an array.
pub const DEFAULT_ARRAY_TASK_TYPE: &str = "sequence";

/// Task type used for bare-string items inside a sequence.
pub const DEFAULT_ARRAY_ITEM_TASK_TYPE: &str = "ref";

/// Case key that marks the fallback arm of a switch task.
pub const SWITCH_DEFAULT_CASE: &str = "__default__";

/// Exit code reported when a run is interrupted by Ctrl+C.
pub const EXIT_INTERRUPTED: i32 = 130;

/// How long a child may linger after an interrupt before it is killed.
pub const INTERRUPT_GRACE_MS: u64 = 2_000;
