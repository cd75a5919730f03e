// Pipeline Validator
// Checks a parsed definition and resolves it into the typed execution model

use crate::error::{ConfigError, ValidationErrors};
use crate::execution::matrix::MatrixExpander;
use crate::parser::models::{
    scalar_to_string, IsolationDefinition, PipelineDefinition, RunAsDefinition, StepDefinition,
};
use crate::pipeline::install::installer_step;
use crate::pipeline::models::{
    EnvEffects, Isolation, JobEnvironment, MatrixAxis, Pipeline, ProvisionSettings, RunAs, Step,
    Suite, WorkspaceMount,
};

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Validator and resolver for parsed pipelines
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a definition, collecting every problem found
    pub fn validate(definition: &PipelineDefinition) -> Result<(), ValidationErrors> {
        Self::resolve(definition.clone()).map(|_| ())
    }

    /// Validate and resolve a definition into an executable pipeline
    pub fn resolve(definition: PipelineDefinition) -> Result<Pipeline, ValidationErrors> {
        let mut errors = Vec::new();

        let axes = Self::resolve_axes(&definition, &mut errors);
        let axis_names: Vec<&str> = axes.iter().map(|a| a.name.as_str()).collect();

        let exclude = Self::resolve_assignments(
            &definition.matrix.exclude,
            "exclude",
            &axis_names,
            false,
            &mut errors,
        );
        let include = Self::resolve_assignments(
            &definition.matrix.include,
            "include",
            &axis_names,
            true,
            &mut errors,
        );

        let mut vars = BTreeMap::new();
        for (key, value) in &definition.env {
            match scalar_to_string(value) {
                Some(value) => {
                    vars.insert(key.clone(), value);
                }
                None => errors.push(ConfigError::InvalidEnv {
                    key: key.clone(),
                    value: format!("{:?}", value),
                    reason: "environment values must be scalars".to_string(),
                }),
            }
        }
        let environment = match JobEnvironment::from_vars(vars) {
            Ok(environment) => Some(environment),
            Err(mut env_errors) => {
                errors.append(&mut env_errors);
                None
            }
        };

        let isolation = match &definition.isolation {
            IsolationDefinition::Host => Isolation::Host,
            IsolationDefinition::Container {
                image_axis,
                keep,
                pull,
                workspace,
            } => {
                if !axis_names.is_empty() && !axis_names.contains(&image_axis.as_str()) {
                    errors.push(ConfigError::UnknownImageAxis(image_axis.clone()));
                }
                let workspace = workspace.as_ref().map(|workspace| {
                    if workspace.source.trim().is_empty() {
                        errors.push(ConfigError::InvalidWorkspace(
                            "source directory is empty".to_string(),
                        ));
                    }
                    if !workspace.target.starts_with('/') {
                        errors.push(ConfigError::InvalidWorkspace(format!(
                            "target '{}' is not an absolute path",
                            workspace.target
                        )));
                    }
                    WorkspaceMount {
                        source: PathBuf::from(&workspace.source),
                        target: workspace.target.clone(),
                    }
                });
                Isolation::Container {
                    image_axis: image_axis.clone(),
                    keep: *keep,
                    pull: *pull,
                    workspace,
                }
            }
        };

        let setup = Self::resolve_steps(
            &definition.provision.setup,
            "provision.setup",
            RunAs::Root,
            &mut errors,
        );
        // Setup runs before ownership of the home directory moves to the identity
        for (index, step) in setup.iter().enumerate() {
            if step.run_as == RunAs::Provisioned {
                errors.push(ConfigError::SetupRunsAsUser(index));
            }
        }
        let lint = Self::resolve_steps(&definition.lint, "lint", RunAs::Root, &mut errors);
        let mut install = Self::resolve_steps(
            &definition.install.steps,
            "install",
            RunAs::Provisioned,
            &mut errors,
        );

        if let Some(installer) = &definition.install.installer {
            if installer.script.trim().is_empty() {
                errors.push(ConfigError::EmptyInstaller);
            }
            let package = environment
                .as_ref()
                .map(|env| env.package.as_str())
                .unwrap_or_default();
            install.push(installer_step(
                installer,
                &definition.install.activate,
                package,
            ));
        }

        let suites = Self::resolve_suites(&definition, &mut errors);

        let environment = match environment {
            Some(environment) if errors.is_empty() => environment,
            _ => return Err(ValidationErrors(errors)),
        };

        let user = definition
            .provision
            .user
            .clone()
            .unwrap_or_else(|| environment.package.clone());

        let pipeline = Pipeline {
            name: definition
                .name
                .clone()
                .unwrap_or_else(|| environment.package.clone()),
            axes,
            exclude,
            include,
            isolation,
            provision: ProvisionSettings {
                user,
                shell: definition
                    .provision
                    .shell
                    .clone()
                    .unwrap_or_else(|| "/bin/bash".to_string()),
                setup,
            },
            environment,
            forward_env: definition.forward_env.clone(),
            lint,
            install,
            suites,
            notify: definition.notify.clone(),
        };

        let jobs = MatrixExpander::assignments(&pipeline).len();
        if jobs == 0 {
            return Err(ConfigError::NoJobs.into());
        }
        if pipeline.isolation == Isolation::Host && jobs > 1 {
            let errors = Self::check_identity_range(&pipeline.environment, jobs);
            if !errors.is_empty() {
                return Err(ValidationErrors(errors));
            }
        }
        Ok(pipeline)
    }

    /// Host jobs offset uid and gid by their index; the last job must still fit in u32
    fn check_identity_range(environment: &JobEnvironment, jobs: usize) -> Vec<ConfigError> {
        let last = u32::try_from(jobs - 1).ok();
        [("TEST_UID", environment.uid), ("TEST_GID", environment.gid)]
            .into_iter()
            .filter(|(_, base)| last.and_then(|last| base.checked_add(last)).is_none())
            .map(|(key, base)| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: base.to_string(),
                reason: format!("{} host jobs would need ids past {}", jobs, u32::MAX),
            })
            .collect()
    }

    fn resolve_axes(
        definition: &PipelineDefinition,
        errors: &mut Vec<ConfigError>,
    ) -> Vec<MatrixAxis> {
        if definition.matrix.axes.is_empty() {
            errors.push(ConfigError::NoAxes);
            return Vec::new();
        }

        let mut axes = Vec::new();
        for (name, raw_values) in &definition.matrix.axes {
            let values: Option<Vec<String>> = raw_values.iter().map(scalar_to_string).collect();
            let Some(values) = values else {
                errors.push(ConfigError::NonScalarAxisValue { axis: name.clone() });
                continue;
            };
            match MatrixAxis::new(name.clone(), values) {
                Ok(axis) => axes.push(axis),
                Err(e) => errors.push(e),
            }
        }
        axes
    }

    fn resolve_assignments(
        entries: &[IndexMap<String, serde_yaml::Value>],
        section: &'static str,
        axis_names: &[&str],
        require_all: bool,
        errors: &mut Vec<ConfigError>,
    ) -> Vec<IndexMap<String, String>> {
        let mut resolved = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            let mut assignment = IndexMap::new();
            for (axis, value) in entry {
                if !axis_names.contains(&axis.as_str()) {
                    errors.push(ConfigError::UnknownAxis {
                        section,
                        index,
                        axis: axis.clone(),
                    });
                    continue;
                }
                match scalar_to_string(value) {
                    Some(value) => {
                        assignment.insert(axis.clone(), value);
                    }
                    None => errors.push(ConfigError::NonScalarAxisValue { axis: axis.clone() }),
                }
            }

            if require_all {
                for axis in axis_names {
                    if !entry.contains_key(*axis) {
                        errors.push(ConfigError::IncompleteInclude {
                            index,
                            axis: axis.to_string(),
                        });
                    }
                }
                // Keep axis declaration order regardless of how the entry was written
                let position = |axis: &String| axis_names.iter().position(|name| name == axis);
                assignment.sort_by(|a, _, b, _| position(a).cmp(&position(b)));
            }

            resolved.push(assignment);
        }

        resolved
    }

    fn resolve_steps(
        steps: &[StepDefinition],
        section: &str,
        default_run_as: RunAs,
        errors: &mut Vec<ConfigError>,
    ) -> Vec<Step> {
        steps
            .iter()
            .enumerate()
            .map(|(index, def)| {
                if def.run.trim().is_empty() {
                    errors.push(ConfigError::EmptyScript {
                        section: section.to_string(),
                        index,
                    });
                }
                Self::resolve_step(def, section, index, default_run_as)
            })
            .collect()
    }

    fn resolve_step(
        def: &StepDefinition,
        section: &str,
        index: usize,
        default_run_as: RunAs,
    ) -> Step {
        let run_as = match def.run_as {
            Some(RunAsDefinition::Root) => RunAs::Root,
            Some(RunAsDefinition::User) => RunAs::Provisioned,
            None => default_run_as,
        };

        Step {
            name: def
                .name
                .clone()
                .unwrap_or_else(|| format!("{}[{}]", section, index)),
            script: def.run.clone(),
            run_as,
            pass_env: def.pass_env.clone(),
            effects: EnvEffects {
                export: def
                    .export
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                prepend_path: def.prepend_path.clone(),
            },
            timeout: def.timeout_minutes.map(|m| Duration::from_secs(m * 60)),
            working_dir: def.working_directory.clone(),
        }
    }

    fn resolve_suites(definition: &PipelineDefinition, errors: &mut Vec<ConfigError>) -> Vec<Suite> {
        let tests = &definition.tests;
        let mut seen = HashSet::new();

        tests
            .suites
            .iter()
            .enumerate()
            .map(|(index, def)| {
                if def.name.trim().is_empty() {
                    errors.push(ConfigError::EmptySuiteName(index));
                } else if !seen.insert(def.name.clone()) {
                    errors.push(ConfigError::DuplicateSuite(def.name.clone()));
                }

                Suite {
                    name: def.name.clone(),
                    path: def.path.clone(),
                    tree: tests.tree.clone(),
                    command: def.command.clone().unwrap_or_else(|| tests.command.clone()),
                    parallel_flag: tests.parallel_flag.clone(),
                    workers: def.workers,
                    pass_env: def.pass_env.clone(),
                    timeout: def.timeout_minutes.map(|m| Duration::from_secs(m * 60)),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::ImagePullPolicy;
    use crate::parser::PipelineParser;

    const BASE: &str = r#"
env:
  PACKAGE: firedrake
  HOME_DIR: /home/firedrake
  TEST_UID: 1000
  TEST_GID: 1000
  CI: 1
"#;

    fn resolve(extra: &str) -> Result<Pipeline, ValidationErrors> {
        let yaml = format!("{}{}", BASE, extra);
        PipelineValidator::resolve(PipelineParser::parse(&yaml).unwrap())
    }

    #[test]
    fn test_resolve_minimal() {
        let pipeline = resolve("matrix:\n  BASE_IMAGE: [\"ubuntu:16.04\"]\n").unwrap();

        assert_eq!(pipeline.name, "firedrake");
        assert_eq!(pipeline.provision.user, "firedrake");
        assert_eq!(pipeline.provision.shell, "/bin/bash");
        assert_eq!(pipeline.axes[0].values, vec!["ubuntu:16.04"]);
        assert_eq!(pipeline.isolation, Isolation::Host);
        assert_eq!(pipeline.environment.uid, 1000);
    }

    #[test]
    fn test_empty_axis_is_rejected() {
        let errors = resolve("matrix:\n  BASE_IMAGE: []\n").unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::EmptyAxis("BASE_IMAGE".to_string())]
        );
    }

    #[test]
    fn test_excluding_every_job_is_rejected() {
        let errors = resolve(
            "matrix:\n  BASE_IMAGE: [\"ubuntu:16.04\"]\n  exclude:\n    - BASE_IMAGE: \"ubuntu:16.04\"\n",
        )
        .unwrap_err();
        assert_eq!(errors.errors(), &[ConfigError::NoJobs]);
    }

    #[test]
    fn test_missing_matrix_is_rejected() {
        let errors = resolve("").unwrap_err();
        assert!(errors.errors().contains(&ConfigError::NoAxes));
    }

    #[test]
    fn test_missing_env_is_rejected() {
        let def = PipelineParser::parse("matrix:\n  A: [x]\nenv:\n  PACKAGE: p\n").unwrap();
        let errors = PipelineValidator::validate(&def).unwrap_err();
        assert!(errors
            .errors()
            .contains(&ConfigError::MissingEnv("HOME_DIR".to_string())));
    }

    #[test]
    fn test_step_defaults_per_section() {
        let pipeline = resolve(
            r#"
matrix:
  A: [x]
lint:
  - run: make lint
install:
  steps:
    - name: deps
      run: pip install -r requirements.txt
    - name: system
      run: apt-get install -y gfortran
      run_as: root
"#,
        )
        .unwrap();

        assert_eq!(pipeline.lint[0].name, "lint[0]");
        assert_eq!(pipeline.lint[0].run_as, RunAs::Root);
        assert_eq!(pipeline.install[0].run_as, RunAs::Provisioned);
        assert_eq!(pipeline.install[1].run_as, RunAs::Root);
    }

    #[test]
    fn test_installer_appended_to_install_phase() {
        let pipeline = resolve(
            r#"
matrix:
  A: [x]
install:
  steps:
    - run: echo before
  installer:
    script: firedrake-install
"#,
        )
        .unwrap();

        assert_eq!(pipeline.install.len(), 2);
        assert_eq!(pipeline.install[1].name, "install firedrake");
        assert!(pipeline.install[1].script.starts_with("firedrake-install"));
    }

    #[test]
    fn test_include_must_assign_every_axis() {
        let errors = resolve(
            r#"
matrix:
  BASE_IMAGE: ["ubuntu:16.04"]
  PYTHON: ["3.6"]
  include:
    - BASE_IMAGE: "ubuntu:18.04"
"#,
        )
        .unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::IncompleteInclude {
                index: 0,
                axis: "PYTHON".to_string()
            }]
        );
    }

    #[test]
    fn test_include_is_reordered_to_axis_order() {
        let pipeline = resolve(
            r#"
matrix:
  BASE_IMAGE: ["ubuntu:16.04"]
  PYTHON: ["3.6"]
  include:
    - PYTHON: "3.7"
      BASE_IMAGE: "ubuntu:18.04"
"#,
        )
        .unwrap();
        let keys: Vec<_> = pipeline.include[0].keys().cloned().collect();
        assert_eq!(keys, vec!["BASE_IMAGE", "PYTHON"]);
    }

    #[test]
    fn test_exclude_unknown_axis() {
        let errors = resolve("matrix:\n  A: [x]\n  exclude:\n    - B: y\n").unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::UnknownAxis {
                section: "exclude",
                index: 0,
                axis: "B".to_string()
            }]
        );
    }

    #[test]
    fn test_container_image_axis_must_exist() {
        let errors = resolve(
            "matrix:\n  PYTHON: [\"3.6\"]\nisolation:\n  mode: container\n",
        )
        .unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::UnknownImageAxis("BASE_IMAGE".to_string())]
        );
    }

    #[test]
    fn test_duplicate_suites() {
        let errors = resolve(
            r#"
matrix:
  A: [x]
tests:
  suites:
    - name: regression
      path: tests/regression
    - name: regression
      path: tests/other
"#,
        )
        .unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::DuplicateSuite("regression".to_string())]
        );
    }

    #[test]
    fn test_empty_script() {
        let errors = resolve("matrix:\n  A: [x]\nlint:\n  - run: \"  \"\n").unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::EmptyScript {
                section: "lint".to_string(),
                index: 0
            }]
        );
    }

    #[test]
    fn test_suites_inherit_test_settings() {
        let pipeline = resolve(
            r#"
matrix:
  A: [x]
tests:
  tree: ${HOME_DIR}/src
  command: py.test -v
  suites:
    - name: regression
      path: tests/regression
      workers: 4
    - name: custom
      path: tests/custom
      command: make test
"#,
        )
        .unwrap();

        assert_eq!(pipeline.suites[0].command, "py.test -v");
        assert_eq!(pipeline.suites[0].tree.as_deref(), Some("${HOME_DIR}/src"));
        assert_eq!(pipeline.suites[1].command, "make test");
    }

    #[test]
    fn test_repeated_axis_value_is_rejected() {
        let errors =
            resolve("matrix:\n  BASE_IMAGE: [\"ubuntu:16.04\", \"ubuntu:16.04\"]\n").unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::DuplicateAxisValue {
                axis: "BASE_IMAGE".to_string(),
                value: "ubuntu:16.04".to_string(),
            }]
        );
    }

    #[test]
    fn test_numeric_and_string_duplicates_collide() {
        let errors = resolve("matrix:\n  PYTHON: [3, \"3\"]\n").unwrap_err();
        assert!(matches!(
            errors.errors(),
            [ConfigError::DuplicateAxisValue { axis, .. }] if axis == "PYTHON"
        ));
    }

    #[test]
    fn test_host_identity_offsets_must_fit() {
        let yaml = r#"
matrix:
  A: [x, y]
env:
  PACKAGE: firedrake
  HOME_DIR: /home/firedrake
  TEST_UID: 4294967295
  TEST_GID: 1000
  CI: 1
"#;
        let errors = PipelineValidator::resolve(PipelineParser::parse(yaml).unwrap()).unwrap_err();
        assert_eq!(errors.errors().len(), 1);
        assert!(matches!(
            &errors.errors()[0],
            ConfigError::InvalidEnv { key, .. } if key == "TEST_UID"
        ));

        // One job keeps the declared identity, so the maximum uid is fine
        let single = yaml.replace("A: [x, y]", "A: [x]");
        assert!(PipelineValidator::resolve(PipelineParser::parse(&single).unwrap()).is_ok());

        // Containers never offset identities
        let container = yaml.replace("A: [x, y]", "BASE_IMAGE: [a, b]")
            + "isolation:\n  mode: container\n";
        assert!(PipelineValidator::resolve(PipelineParser::parse(&container).unwrap()).is_ok());
    }

    #[test]
    fn test_setup_step_cannot_run_as_user() {
        let errors = resolve(
            r#"
matrix:
  A: [x]
provision:
  setup:
    - run: apt-get install -y sudo
    - run: touch ~/marker
      run_as: user
"#,
        )
        .unwrap_err();
        assert_eq!(errors.errors(), &[ConfigError::SetupRunsAsUser(1)]);
    }

    #[test]
    fn test_container_workspace_and_pull_policy() {
        let pipeline = resolve(
            r#"
matrix:
  BASE_IMAGE: ["ubuntu:16.04"]
isolation:
  mode: container
  pull: always
  workspace:
    source: .
    target: /src/firedrake
"#,
        )
        .unwrap();
        assert_eq!(
            pipeline.isolation,
            Isolation::Container {
                image_axis: "BASE_IMAGE".to_string(),
                keep: false,
                pull: ImagePullPolicy::Always,
                workspace: Some(WorkspaceMount {
                    source: PathBuf::from("."),
                    target: "/src/firedrake".to_string(),
                }),
            }
        );
        assert_eq!(pipeline.product_size(), 1);
    }

    #[test]
    fn test_relative_workspace_target_is_rejected() {
        let errors = resolve(
            "matrix:\n  BASE_IMAGE: [a]\nisolation:\n  mode: container\n  workspace:\n    source: .\n    target: src\n",
        )
        .unwrap_err();
        assert!(matches!(errors.errors(), [ConfigError::InvalidWorkspace(_)]));
    }
}
