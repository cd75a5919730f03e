// Parser module for lockstep pipelines
// Provides YAML parsing with positioned, human-friendly errors

pub mod error;
pub mod models;
pub mod yaml;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use models::*;
pub use yaml::PipelineParser;
