// Pipeline YAML Parser
// Reads lockstep pipeline files into their serde definition

use crate::parser::error::{ParseError, ParseResult};
use crate::parser::models::PipelineDefinition;

use std::fs;
use std::path::Path;

/// Parser for lockstep pipeline YAML files
pub struct PipelineParser;

impl PipelineParser {
    /// Parse a pipeline definition from a YAML string
    pub fn parse(content: &str) -> ParseResult<PipelineDefinition> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    /// Parse a pipeline definition from a file.
    ///
    /// When the document has no `name`, the file stem is used instead.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<PipelineDefinition> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ParseError::io(format!("failed to read {}: {}", path.display(), e)))?;

        let mut definition = Self::parse(&content)?;
        if definition.name.is_none() {
            definition.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string());
        }
        Ok(definition)
    }
}
