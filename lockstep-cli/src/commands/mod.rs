pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use clap::Args;
use color_eyre::Result;

use lockstep_service::parser::models::{
    default_image_axis, default_workspace_target, IsolationDefinition, WorkspaceDefinition,
};
use lockstep_service::{Pipeline, PipelineDefinition, PipelineParser, PipelineValidator};

/// Options that rewrite the pipeline definition before it is validated
#[derive(Args, Debug, Default)]
pub struct DefinitionOverrides {
    /// Override a job environment entry (repeatable, format: NAME=VALUE)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Run every job in its own container, whatever the pipeline declares
    #[arg(long, conflicts_with = "host")]
    pub container: bool,

    /// Run every job on this host, whatever the pipeline declares
    #[arg(long)]
    pub host: bool,

    /// Keep job containers after the run for inspection
    #[arg(long)]
    pub keep: bool,

    /// Mount this directory into every job container
    #[arg(long, value_name = "DIR", conflicts_with = "host")]
    pub workspace: Option<String>,
}

impl DefinitionOverrides {
    pub fn apply(&self, definition: &mut PipelineDefinition) -> Result<()> {
        for var in &self.variables {
            let Some((name, value)) = var.split_once('=') else {
                color_eyre::eyre::bail!("Invalid variable format '{}'. Expected NAME=VALUE", var);
            };
            definition.env.insert(
                name.trim().to_string(),
                serde_yaml::Value::String(value.to_string()),
            );
        }

        if self.host {
            definition.isolation = IsolationDefinition::Host;
        } else if self.container {
            if let IsolationDefinition::Host = definition.isolation {
                definition.isolation = IsolationDefinition::Container {
                    image_axis: default_image_axis(),
                    keep: false,
                    pull: Default::default(),
                    workspace: None,
                };
            }
        }

        if let IsolationDefinition::Container {
            keep, workspace, ..
        } = &mut definition.isolation
        {
            if self.keep {
                *keep = true;
            }
            if let Some(source) = &self.workspace {
                let target = workspace
                    .take()
                    .map(|existing| existing.target)
                    .unwrap_or_else(default_workspace_target);
                *workspace = Some(WorkspaceDefinition {
                    source: source.clone(),
                    target,
                });
            }
        }
        Ok(())
    }
}

/// Parse, override and resolve a pipeline file, printing every problem found.
///
/// Exits with status 1 on parse or validation errors.
pub fn load_pipeline(path: &Path, overrides: &DefinitionOverrides) -> Result<Pipeline> {
    if !path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", path.display());
    }

    let mut definition = match PipelineParser::parse_file(path) {
        Ok(definition) => definition,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if !e.context.is_empty() {
                output::dim(&e.context);
            }
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
    };
    overrides.apply(&mut definition)?;

    match PipelineValidator::resolve(definition) {
        Ok(pipeline) => Ok(pipeline),
        Err(errors) => {
            output::error(&format!("{} validation error(s):", errors.errors().len()));
            for error in errors.errors() {
                output::error(&format!("  - {}", error));
            }
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_override_replaces_env_entry() {
        let mut definition = PipelineParser::parse("env:\n  PACKAGE: firedrake\n").unwrap();
        let overrides = DefinitionOverrides {
            variables: vec!["PACKAGE=pyop2".to_string(), "EXTRA=a=b".to_string()],
            ..DefinitionOverrides::default()
        };
        overrides.apply(&mut definition).unwrap();

        assert_eq!(
            definition.env["PACKAGE"],
            serde_yaml::Value::String("pyop2".to_string())
        );
        assert_eq!(
            definition.env["EXTRA"],
            serde_yaml::Value::String("a=b".to_string())
        );
    }

    #[test]
    fn test_bad_var_is_rejected() {
        let mut definition = PipelineDefinition::default();
        let overrides = DefinitionOverrides {
            variables: vec!["NOEQUALS".to_string()],
            ..DefinitionOverrides::default()
        };
        assert!(overrides.apply(&mut definition).is_err());
    }

    #[test]
    fn test_container_override_with_keep() {
        let mut definition = PipelineDefinition::default();
        let overrides = DefinitionOverrides {
            container: true,
            keep: true,
            ..DefinitionOverrides::default()
        };
        overrides.apply(&mut definition).unwrap();
        assert_eq!(
            definition.isolation,
            IsolationDefinition::Container {
                image_axis: "BASE_IMAGE".to_string(),
                keep: true,
                pull: Default::default(),
                workspace: None,
            }
        );
    }

    #[test]
    fn test_workspace_override_keeps_declared_target() {
        let mut definition = PipelineParser::parse(
            "isolation:\n  mode: container\n  workspace:\n    source: old\n    target: /src/firedrake\n",
        )
        .unwrap();
        let overrides = DefinitionOverrides {
            workspace: Some("/ci/checkout".to_string()),
            ..DefinitionOverrides::default()
        };
        overrides.apply(&mut definition).unwrap();

        let IsolationDefinition::Container { workspace, .. } = definition.isolation else {
            panic!("expected container isolation");
        };
        assert_eq!(
            workspace,
            Some(WorkspaceDefinition {
                source: "/ci/checkout".to_string(),
                target: "/src/firedrake".to_string(),
            })
        );
    }

    #[test]
    fn test_workspace_override_with_container() {
        let mut definition = PipelineDefinition::default();
        let overrides = DefinitionOverrides {
            container: true,
            workspace: Some(".".to_string()),
            ..DefinitionOverrides::default()
        };
        overrides.apply(&mut definition).unwrap();

        let IsolationDefinition::Container { workspace, .. } = definition.isolation else {
            panic!("expected container isolation");
        };
        assert_eq!(workspace.map(|w| w.target), Some("/workspace".to_string()));
    }

    #[test]
    fn test_host_override() {
        let mut definition = PipelineParser::parse("isolation:\n  mode: container\n").unwrap();
        let overrides = DefinitionOverrides {
            host: true,
            ..DefinitionOverrides::default()
        };
        overrides.apply(&mut definition).unwrap();
        assert_eq!(definition.isolation, IsolationDefinition::Host);
    }
}
