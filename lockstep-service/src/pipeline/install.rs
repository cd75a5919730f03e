// Installer invocation
// Renders the external install script and its flags into an install-phase step

use crate::parser::models::{ActivateDefinition, InstallerDefinition};
use crate::pipeline::models::{EnvEffects, Step, COMMIT_ENV};
use crate::utils::shell_quote;

use std::time::Duration;

/// Build the argument vector for the installer.
///
/// Order is fixed: interpreter, script, switches, valued options, dependency
/// branches, then the revision under test expressed as a branch of `package`.
pub fn installer_args(installer: &InstallerDefinition, package: &str) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(interpreter) = &installer.interpreter {
        args.push(interpreter.clone());
    }
    args.push(installer.script.clone());

    for switch in &installer.switches {
        args.push(flag(switch));
    }

    for (option, value) in &installer.options {
        args.push(flag(option));
        args.push(value.clone());
    }

    for (dependency, branch) in &installer.package_branches {
        args.push("--package-branch".to_string());
        args.push(dependency.clone());
        args.push(branch.clone());
    }

    if let Some(revision) = &installer.revision {
        args.push("--package-branch".to_string());
        args.push(package.to_string());
        args.push(revision.clone());
    }

    args
}

fn flag(name: &str) -> String {
    if name.starts_with('-') {
        name.to_string()
    } else {
        format!("--{}", name)
    }
}

/// Turn the installer into a step run as the provisioned identity from its home.
///
/// Arguments are quoted individually except that `${VAR}` references survive
/// quoting so they are expanded by the orchestrator before the shell sees them.
/// The revision defaults to `${COMMIT}`. A revision that refers to variables is
/// bound to a shell variable first, and the `--package-branch` flag is dropped
/// when it comes out empty.
pub fn installer_step(
    installer: &InstallerDefinition,
    activate: &ActivateDefinition,
    package: &str,
) -> Step {
    let revision = installer
        .revision
        .clone()
        .unwrap_or_else(|| format!("${{{}}}", COMMIT_ENV));
    let script = if revision.contains("${") {
        let fixed = InstallerDefinition {
            revision: None,
            ..installer.clone()
        };
        format!(
            "revision={}; {} ${{revision:+--package-branch {} \"$revision\"}}",
            quote_preserving_vars(&revision),
            render(&installer_args(&fixed, package)),
            shell_quote(package)
        )
    } else {
        let fixed = InstallerDefinition {
            revision: Some(revision),
            ..installer.clone()
        };
        render(&installer_args(&fixed, package))
    };

    let mut step = Step::new(format!("install {}", package), script)
        .as_provisioned()
        .with_working_dir("${HOME_DIR}");
    step.pass_env = installer.pass_env.clone();
    step.timeout = installer.timeout_minutes.map(|m| Duration::from_secs(m * 60));
    step.effects = EnvEffects {
        export: activate
            .export
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        prepend_path: activate.prepend_path.clone(),
    };
    step
}

fn render(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_preserving_vars(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote an argument, leaving whole-word `${VAR}` references expandable.
///
/// Expansion happens before the command reaches the shell, so a quoted
/// reference still receives its value.
fn quote_preserving_vars(arg: &str) -> String {
    if arg.contains("${") {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"").replace('`', "\\`"))
    } else {
        shell_quote(arg)
    }
}
