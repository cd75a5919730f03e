// Pipeline definition models
// Serde representation of a lockstep pipeline YAML document

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Root pipeline document, as written by users
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    /// Pipeline name (defaults to the file stem)
    #[serde(default)]
    pub name: Option<String>,

    /// Build matrix
    #[serde(default)]
    pub matrix: MatrixDefinition,

    /// Fixed environment passed to every job
    #[serde(default)]
    pub env: IndexMap<String, serde_yaml::Value>,

    /// How jobs are isolated from each other
    #[serde(default)]
    pub isolation: IsolationDefinition,

    /// Identity provisioning options
    #[serde(default)]
    pub provision: ProvisionDefinition,

    /// Keys always forwarded across the privilege boundary
    #[serde(default = "default_forward_env")]
    pub forward_env: Vec<String>,

    /// Cheap checks run before the install phase
    #[serde(default)]
    pub lint: Vec<StepDefinition>,

    /// Installation phase
    #[serde(default)]
    pub install: InstallDefinition,

    /// Test phase
    #[serde(default)]
    pub tests: TestsDefinition,

    /// Completion notification
    #[serde(default)]
    pub notify: Option<NotifyDefinition>,
}

pub fn default_forward_env() -> Vec<String> {
    vec!["PATH".to_string()]
}

/// Matrix axes plus the reserved `exclude` / `include` keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixDefinition {
    /// Partial assignments removed from the product
    #[serde(default)]
    pub exclude: Vec<IndexMap<String, serde_yaml::Value>>,

    /// Full assignments appended after the product
    #[serde(default)]
    pub include: Vec<IndexMap<String, serde_yaml::Value>>,

    /// Axis name to ordered candidate values
    #[serde(flatten)]
    pub axes: IndexMap<String, Vec<serde_yaml::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum IsolationDefinition {
    /// Run on the orchestrator host
    #[default]
    Host,
    /// One disposable container per job
    Container {
        #[serde(default = "default_image_axis")]
        image_axis: String,
        /// Leave containers behind for inspection
        #[serde(default)]
        keep: bool,
        /// When to pull the job image
        #[serde(default)]
        pull: ImagePullPolicy,
        /// Host directory bind-mounted into every job container
        #[serde(default)]
        workspace: Option<WorkspaceDefinition>,
    },
}

pub fn default_image_axis() -> String {
    "BASE_IMAGE".to_string()
}

/// Image pull policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    #[default]
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Source tree shared with job containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceDefinition {
    /// Host directory, relative to where lockstep runs
    pub source: String,
    /// Mount point inside the container, also the default working directory
    #[serde(default = "default_workspace_target")]
    pub target: String,
}

pub fn default_workspace_target() -> String {
    "/workspace".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionDefinition {
    /// Account name (defaults to the PACKAGE environment value)
    #[serde(default)]
    pub user: Option<String>,

    /// Login shell for the account
    #[serde(default)]
    pub shell: Option<String>,

    /// Root steps run before home ownership is transferred
    #[serde(default)]
    pub setup: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAsDefinition {
    Root,
    User,
}

/// A single shell step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: Option<String>,

    pub run: String,

    #[serde(default)]
    pub run_as: Option<RunAsDefinition>,

    /// Extra keys forwarded when running as the provisioned identity
    #[serde(default)]
    pub pass_env: Vec<String>,

    /// Variables set after the step succeeds
    #[serde(default)]
    pub export: IndexMap<String, String>,

    /// Directories prepended to PATH after the step succeeds
    #[serde(default)]
    pub prepend_path: Vec<String>,

    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    #[serde(default)]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallDefinition {
    /// Steps run before the installer
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// The external installation script
    #[serde(default)]
    pub installer: Option<InstallerDefinition>,

    /// Environment changes applied once the installer succeeds
    #[serde(default)]
    pub activate: ActivateDefinition,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerDefinition {
    /// Path to the installer, relative to the job's working directory or absolute
    pub script: String,

    /// Interpreter used to run the script (e.g. python3)
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Boolean flags rendered as `--<switch>`
    #[serde(default)]
    pub switches: Vec<String>,

    /// Valued flags rendered as `--<option> <value>`
    #[serde(default)]
    pub options: IndexMap<String, String>,

    /// Dependency branches rendered as `--package-branch <package> <branch>`
    #[serde(default)]
    pub package_branches: IndexMap<String, String>,

    /// Revision of the package under test
    #[serde(default)]
    pub revision: Option<String>,

    #[serde(default)]
    pub pass_env: Vec<String>,

    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateDefinition {
    #[serde(default)]
    pub prepend_path: Vec<String>,

    #[serde(default)]
    pub export: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestsDefinition {
    /// Root of the installed tree that suite paths are relative to
    #[serde(default)]
    pub tree: Option<String>,

    /// Test runner command
    #[serde(default = "default_test_command")]
    pub command: String,

    /// Flag carrying the worker count
    #[serde(default = "default_parallel_flag")]
    pub parallel_flag: String,

    #[serde(default)]
    pub suites: Vec<SuiteDefinition>,
}

impl Default for TestsDefinition {
    fn default() -> Self {
        Self {
            tree: None,
            command: default_test_command(),
            parallel_flag: default_parallel_flag(),
            suites: Vec::new(),
        }
    }
}

pub fn default_test_command() -> String {
    "python -m pytest".to_string()
}

pub fn default_parallel_flag() -> String {
    "-n".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteDefinition {
    pub name: String,

    /// Suite entry point relative to the test tree
    pub path: String,

    /// Requested internal parallelism
    #[serde(default)]
    pub workers: Option<u32>,

    /// Overrides the shared test command
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub pass_env: Vec<String>,

    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyDefinition {
    /// Destination channel descriptor
    pub channel: String,

    /// Sender identity shown in the channel
    #[serde(default = "default_sender")]
    pub sender: String,

    /// Environment variable holding the webhook URL
    #[serde(default = "default_webhook_env")]
    pub webhook_env: String,
}

pub fn default_sender() -> String {
    "lockstep".to_string()
}

pub fn default_webhook_env() -> String {
    "LOCKSTEP_WEBHOOK_URL".to_string()
}

/// Render a YAML scalar the way it was written, if it is a scalar
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Sequence(_)
        | serde_yaml::Value::Mapping(_)
        | serde_yaml::Value::Tagged(_) => None,
    }
}
