// Pipeline module
// Resolved pipeline model, validation and installer rendering

pub mod install;
pub mod models;
pub mod validator;

pub use models::{
    EnvEffects, Isolation, JobEnvironment, MatrixAxis, Pipeline, ProvisionSettings, RunAs, Step,
    Suite, WorkspaceMount, COMMIT_ENV, REQUIRED_ENV,
};
pub use validator::PipelineValidator;
