// Parser error types with helpful error messages
// Provides line/column info, surrounding source and suggestions for common mistakes

use std::fmt;

/// Detailed parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Surrounding context (a few lines around the error)
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Well-formed YAML that does not match the pipeline schema
    InvalidSchema,
    /// File could not be read
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::IoError)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the lines surrounding the error position
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column + 7) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Create from a serde_yaml error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let message = format_yaml_error_message(err);
        // Well-formed YAML that still failed can only have missed the schema
        let kind = match serde_yaml::from_str::<serde_yaml::Value>(source) {
            Ok(_) => ParseErrorKind::InvalidSchema,
            Err(_) => ParseErrorKind::YamlSyntax,
        };

        let mut error = ParseError::new(message, line, column)
            .with_kind(kind)
            .with_source_context(source, 2);
        error.suggestion = suggest_yaml_fix(err, source, line);
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if msg.contains("missing field") {
        if let Some(field) = extract_between(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }

    if msg.contains("unknown field") {
        if let Some(field) = extract_between(&msg, "unknown field `", "`") {
            if let Some(expected) = extract_expected(&msg) {
                return format!(
                    "unknown field '{}', expected one of: {}",
                    field,
                    expected.join(", ")
                );
            }
            return format!("unknown field '{}'", field);
        }
    }

    if msg.contains("invalid type") {
        if let (Some(expected), Some(found)) = (
            extract_between(&msg, "expected ", " at"),
            extract_between(&msg, "invalid type: ", ","),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    // serde_yaml appends " at line X column Y"; the location is reported separately
    match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn extract_expected(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let fields_str = &msg[start..];
    let end = fields_str.find(" at").unwrap_or(fields_str.len());
    Some(
        fields_str[..end]
            .split(", ")
            .map(|s| s.trim_matches('`').to_string())
            .collect(),
    )
}

fn suggest_yaml_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let lines: Vec<&str> = source.lines().collect();
    let error_line = lines.get(line.saturating_sub(1)).copied().unwrap_or("");

    if msg.contains("missing field `run`") {
        return Some("every step needs a 'run:' script".to_string());
    }

    if msg.contains("unknown field `script`") {
        return Some("step commands are written under 'run:', not 'script:'".to_string());
    }

    if msg.contains("unknown variant") && error_line.contains("run_as") {
        return Some("'run_as' accepts 'root' or 'user'".to_string());
    }

    if msg.contains("unknown variant") && error_line.contains("mode") {
        return Some("isolation 'mode' accepts 'host' or 'container'".to_string());
    }

    if error_line.starts_with('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    let typo_suggestions = [
        ("runas", "run_as"),
        ("run-as", "run_as"),
        ("passenv", "pass_env"),
        ("forwardenv", "forward_env"),
        ("prependpath", "prepend_path"),
        ("parallelflag", "parallel_flag"),
    ];

    let lower_line = error_line.to_lowercase();
    for (typo, correct) in typo_suggestions {
        if lower_line.contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'run'", 10, 5)
            .with_suggestion("every step needs a 'run:' script");

        let output = format!("{}", err);
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 10:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_io_error_has_no_location() {
        let output = ParseError::io("pipeline.yml: No such file").to_string();
        assert!(!output.contains("-->"));
        assert!(output.contains("No such file"));
    }

    #[test]
    fn test_parse_error_with_source_context() {
        let source = "name: demo\nmatrix:\n  BASE_IMAGE: [ubuntu:16.04]\nlint:\n  - name: flake8";

        let err = ParseError::new("missing required field 'run'", 5, 5).with_source_context(source, 2);

        assert!(err.context.contains(">    5 |   - name: flake8"));
        assert!(err.context.contains("lint:"));
    }

    #[test]
    fn test_unknown_field_from_yaml() {
        #[derive(Debug, serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        #[allow(dead_code)]
        struct Step {
            run: String,
        }

        let source = "script: echo hi\n";
        let err = serde_yaml::from_str::<Step>(source).unwrap_err();
        let parsed = ParseError::from_yaml_error(&err, source);

        assert!(parsed.message.starts_with("unknown field 'script'"));
        assert_eq!(parsed.kind, ParseErrorKind::InvalidSchema);
        assert_eq!(
            parsed.suggestion.as_deref(),
            Some("step commands are written under 'run:', not 'script:'")
        );
    }

    #[test]
    fn test_extract_between() {
        let msg = "missing field `run` at line 10";
        assert_eq!(
            extract_between(msg, "missing field `", "`"),
            Some("run".to_string())
        );
    }

    fn kind_of(source: &str) -> ParseErrorKind {
        let err = serde_yaml::from_str::<crate::parser::models::PipelineDefinition>(source)
            .unwrap_err();
        ParseError::from_yaml_error(&err, source).kind
    }

    #[test]
    fn test_kind_separates_syntax_from_schema() {
        assert_eq!(kind_of("matrix: [unclosed\n"), ParseErrorKind::YamlSyntax);
        assert_eq!(kind_of("matrix: {a: 1\n"), ParseErrorKind::YamlSyntax);
        assert_eq!(kind_of("lint: 5\n"), ParseErrorKind::InvalidSchema);
        assert_eq!(
            kind_of("isolation:\n  mode: vm\n"),
            ParseErrorKind::InvalidSchema
        );
        assert_eq!(kind_of("lint:\n  - name: x\n"), ParseErrorKind::InvalidSchema);
    }
}
