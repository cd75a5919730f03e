// Service Errors
// Error taxonomy shared by the parser, provisioner, runners and notifier

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Configuration problems detected before any job starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("matrix must declare at least one axis")]
    NoAxes,

    #[error("matrix exclusions remove every job")]
    NoJobs,

    #[error("matrix axis '{0}' has no values")]
    EmptyAxis(String),

    #[error("matrix axis '{axis}' lists value '{value}' more than once")]
    DuplicateAxisValue { axis: String, value: String },

    #[error("matrix axis '{axis}' contains a non-scalar value")]
    NonScalarAxisValue { axis: String },

    #[error("matrix include entry {index} does not assign axis '{axis}'")]
    IncompleteInclude { index: usize, axis: String },

    #[error("matrix {section} entry {index} names unknown axis '{axis}'")]
    UnknownAxis {
        section: &'static str,
        index: usize,
        axis: String,
    },

    #[error("required environment key '{0}' is missing")]
    MissingEnv(String),

    #[error("environment key '{key}' has invalid value '{value}': {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },

    #[error("container isolation uses image axis '{0}', which is not a matrix axis")]
    UnknownImageAxis(String),

    #[error("container workspace is invalid: {0}")]
    InvalidWorkspace(String),

    #[error("provision.setup step {0} runs as the provisioned user before it owns its home")]
    SetupRunsAsUser(usize),

    #[error("step {index} in {section} has an empty script")]
    EmptyScript { section: String, index: usize },

    #[error("test suite {0} has an empty name")]
    EmptySuiteName(usize),

    #[error("test suite '{0}' is declared more than once")]
    DuplicateSuite(String),

    #[error("installer script path is empty")]
    EmptyInstaller,
}

/// Every configuration error found in one validation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "invalid pipeline: {}", single),
            errors => {
                write!(f, "invalid pipeline: {} errors", errors.len())?;
                for error in errors {
                    write!(f, "\n  - {}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ConfigError> for ValidationErrors {
    fn from(error: ConfigError) -> Self {
        Self(vec![error])
    }
}

/// Provisioning stage that was running when a job's environment setup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    Sandbox,
    Group,
    Identity,
    Grant,
    Setup,
    Ownership,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionStage::Sandbox => "sandbox start",
            ProvisionStage::Group => "group creation",
            ProvisionStage::Identity => "identity creation",
            ProvisionStage::Grant => "privilege grant",
            ProvisionStage::Setup => "setup",
            ProvisionStage::Ownership => "ownership transfer",
        };
        f.write_str(name)
    }
}

/// Fatal provisioning failure; never retried
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("provisioning failed during {stage}: {message}")]
pub struct ProvisionError {
    pub stage: ProvisionStage,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ProvisionError {
    pub fn new(stage: ProvisionStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Failures of the execution backend itself (not of the commands it runs)
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("required tool '{0}' was not found on PATH")]
    ToolMissing(String),

    #[error("failed to start sandbox from image '{image}': {message}")]
    SandboxStart { image: String, message: String },

    #[error("failed to remove sandbox '{id}': {message}")]
    SandboxRemove { id: String, message: String },

    #[error("job has no value for image axis '{0}'")]
    MissingImage(String),
}

/// Webhook delivery failures; logged, never fatal
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_validation_error_display() {
        let errors = ValidationErrors::from(ConfigError::EmptyAxis("BASE_IMAGE".to_string()));
        assert_eq!(
            errors.to_string(),
            "invalid pipeline: matrix axis 'BASE_IMAGE' has no values"
        );
    }

    #[test]
    fn test_multiple_validation_errors_display() {
        let errors = ValidationErrors(vec![
            ConfigError::NoAxes,
            ConfigError::MissingEnv("TEST_UID".to_string()),
        ]);
        let text = errors.to_string();
        assert!(text.starts_with("invalid pipeline: 2 errors"));
        assert!(text.contains("- matrix must declare at least one axis"));
        assert!(text.contains("- required environment key 'TEST_UID' is missing"));
    }

    #[test]
    fn test_provision_error_display() {
        let error = ProvisionError::new(ProvisionStage::Ownership, "chown exited with 1")
            .with_exit_code(Some(1));
        assert_eq!(
            error.to_string(),
            "provisioning failed during ownership transfer: chown exited with 1"
        );
        assert_eq!(error.exit_code, Some(1));
    }
}
