// Resolved pipeline model
// Validated, typed form of a pipeline definition consumed by the execution engine

use crate::error::ConfigError;
use crate::parser::models::{ImagePullPolicy, NotifyDefinition};
use crate::utils::{expand_vars, shell_join, shell_quote};

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment keys every pipeline must define
pub const REQUIRED_ENV: [&str; 5] = ["PACKAGE", "HOME_DIR", "TEST_UID", "TEST_GID", "CI"];

/// Job environment key holding the triggering commit, when one is known
pub const COMMIT_ENV: &str = "COMMIT";

/// Validated pipeline ready for execution
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub axes: Vec<MatrixAxis>,
    pub exclude: Vec<IndexMap<String, String>>,
    pub include: Vec<IndexMap<String, String>>,
    pub environment: JobEnvironment,
    pub isolation: Isolation,
    pub provision: ProvisionSettings,
    pub forward_env: Vec<String>,
    pub lint: Vec<Step>,
    pub install: Vec<Step>,
    pub suites: Vec<Suite>,
    pub notify: Option<NotifyDefinition>,
}

impl Pipeline {
    /// Number of jobs the matrix product yields before `exclude`/`include`
    pub fn product_size(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }
}

/// A named build dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if values.is_empty() {
            return Err(ConfigError::EmptyAxis(name));
        }
        for (i, value) in values.iter().enumerate() {
            if values[..i].contains(value) {
                return Err(ConfigError::DuplicateAxisValue {
                    axis: name,
                    value: value.clone(),
                });
            }
        }
        Ok(Self { name, values })
    }
}

/// The fixed environment shared by every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvironment {
    pub package: String,
    pub home: String,
    pub uid: u32,
    pub gid: u32,
    pub ci: bool,
    /// Every declared variable, required keys included
    pub vars: BTreeMap<String, String>,
}

impl JobEnvironment {
    /// Build from raw variables, checking required keys
    pub fn from_vars(vars: BTreeMap<String, String>) -> Result<Self, Vec<ConfigError>> {
        let mut errors = Vec::new();

        for key in REQUIRED_ENV {
            if !vars.contains_key(key) {
                errors.push(ConfigError::MissingEnv(key.to_string()));
            }
        }

        let numeric = |key: &str, errors: &mut Vec<ConfigError>| -> u32 {
            match vars.get(key) {
                Some(value) => value.trim().parse::<u32>().unwrap_or_else(|e| {
                    errors.push(ConfigError::InvalidEnv {
                        key: key.to_string(),
                        value: value.clone(),
                        reason: e.to_string(),
                    });
                    0
                }),
                None => 0,
            }
        };

        let uid = numeric("TEST_UID", &mut errors);
        let gid = numeric("TEST_GID", &mut errors);

        let ci = match vars.get("CI").map(|v| v.trim().to_ascii_lowercase()) {
            Some(flag) => match flag.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "" | "0" | "false" | "no" | "off" => false,
                _ => {
                    errors.push(ConfigError::InvalidEnv {
                        key: "CI".to_string(),
                        value: flag.clone(),
                        reason: "expected a boolean flag".to_string(),
                    });
                    false
                }
            },
            None => false,
        };

        if let Some(home) = vars.get("HOME_DIR") {
            if !home.starts_with('/') {
                errors.push(ConfigError::InvalidEnv {
                    key: "HOME_DIR".to_string(),
                    value: home.clone(),
                    reason: "home directory must be an absolute path".to_string(),
                });
            }
        }

        if let Some(package) = vars.get("PACKAGE") {
            if package.trim().is_empty() {
                errors.push(ConfigError::InvalidEnv {
                    key: "PACKAGE".to_string(),
                    value: package.clone(),
                    reason: "package name is empty".to_string(),
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            package: vars.get("PACKAGE").cloned().unwrap_or_default(),
            home: vars.get("HOME_DIR").cloned().unwrap_or_default(),
            uid,
            gid,
            ci,
            vars,
        })
    }
}

/// Job isolation strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// All jobs share the orchestrator host; identities are made distinct per job
    Host,
    /// Each job gets its own disposable container
    Container {
        image_axis: String,
        keep: bool,
        pull: ImagePullPolicy,
        workspace: Option<WorkspaceMount>,
    },
}

/// Host directory shared with every job container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMount {
    pub source: PathBuf,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub user: String,
    pub shell: String,
    pub setup: Vec<Step>,
}

/// Which identity a step runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAs {
    /// Root, or the build identity the orchestrator itself runs as
    Root,
    /// The unprivileged identity created for the job
    Provisioned,
}

impl fmt::Display for RunAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunAs::Root => write!(f, "root"),
            RunAs::Provisioned => write!(f, "user"),
        }
    }
}

/// Environment changes applied after a step succeeds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvEffects {
    pub export: Vec<(String, String)>,
    pub prepend_path: Vec<String>,
}

impl EnvEffects {
    /// Apply to an environment map, expanding `${VAR}` against it first
    pub fn apply(&self, env: &mut BTreeMap<String, String>) {
        for (key, value) in &self.export {
            let value = expand_vars(value, env);
            env.insert(key.clone(), value);
        }
        for dir in &self.prepend_path {
            let dir = expand_vars(dir, env);
            prepend_path(env, &dir);
        }
    }
}

/// Prepend a directory to PATH in the given environment map
pub fn prepend_path(env: &mut BTreeMap<String, String>, dir: &str) {
    let path = match env.get("PATH") {
        Some(existing) if !existing.is_empty() => format!("{}:{}", dir, existing),
        _ => dir.to_string(),
    };
    env.insert("PATH".to_string(), path);
}

/// An immutable unit of shell work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub script: String,
    pub run_as: RunAs,
    /// Keys forwarded across the privilege boundary in addition to the pipeline allow-list
    pub pass_env: Vec<String>,
    pub effects: EnvEffects,
    pub timeout: Option<Duration>,
    pub working_dir: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            run_as: RunAs::Root,
            pass_env: Vec::new(),
            effects: EnvEffects::default(),
            timeout: None,
            working_dir: None,
        }
    }

    pub fn as_provisioned(mut self) -> Self {
        self.run_as = RunAs::Provisioned;
        self
    }

    pub fn with_pass_env(mut self, keys: &[&str]) -> Self {
        self.pass_env.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn with_export(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.effects.export.push((key.into(), value.into()));
        self
    }

    pub fn with_prepend_path(mut self, dir: impl Into<String>) -> Self {
        self.effects.prepend_path.push(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// An independently invocable collection of tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    pub name: String,
    /// Entry point relative to `tree`
    pub path: String,
    pub tree: Option<String>,
    pub command: String,
    pub parallel_flag: String,
    pub workers: Option<u32>,
    pub pass_env: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Suite {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            tree: None,
            command: crate::parser::models::default_test_command(),
            parallel_flag: crate::parser::models::default_parallel_flag(),
            workers: None,
            pass_env: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_tree(mut self, tree: impl Into<String>) -> Self {
        self.tree = Some(tree.into());
        self
    }

    /// Worker count actually requested, honouring a global override.
    /// A count of zero or one means the suite runs serially.
    pub fn effective_workers(&self, override_workers: Option<u32>) -> Option<u32> {
        override_workers
            .or(self.workers)
            .filter(|workers| *workers > 1)
    }

    /// Render the shell command that runs this suite
    pub fn command_line(&self, override_workers: Option<u32>) -> String {
        let mut line = format!("{} {}", self.command, shell_quote(&self.path));
        if let Some(workers) = self.effective_workers(override_workers) {
            line.push(' ');
            line.push_str(&shell_join([self.parallel_flag.clone(), workers.to_string()]));
        }
        line
    }
}
