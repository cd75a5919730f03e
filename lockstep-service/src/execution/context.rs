// Execution Context
// Per-job identity, privilege grant and the environment threaded through every step

use crate::execution::matrix::{Identity, JobConfig};
use crate::pipeline::models::{prepend_path, EnvEffects, RunAs, Step};
use crate::runners::{Invocation, Principal};
use crate::utils::{expand_vars, is_env_name, shell_quote};

use std::collections::BTreeMap;

/// Passwordless escalation rule for the provisioned identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeGrant {
    pub user: String,
    /// sudoers rule, scoped to all commands
    pub rule: String,
    /// Drop-in file the rule is written to
    pub path: String,
}

impl PrivilegeGrant {
    pub fn for_user(user: &str) -> Self {
        Self {
            user: user.to_string(),
            rule: format!("{} ALL=(ALL) NOPASSWD: ALL", user),
            path: format!("/etc/sudoers.d/{}", user),
        }
    }

    /// Shell script that installs the rule with the permissions sudo requires
    pub fn install_script(&self) -> String {
        let path = shell_quote(&self.path);
        format!(
            "mkdir -p /etc/sudoers.d && printf '%s\\n' {} > {} && chmod 0440 {}",
            shell_quote(&self.rule),
            path,
            path
        )
    }
}

/// A change a step made to the job environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Set { name: String, value: String },
    PrependPath(String),
}

/// State owned by exactly one job for its whole lifetime
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_index: usize,
    pub identity: Identity,
    pub grant: PrivilegeGrant,
    /// Keys always allowed across the privilege boundary
    forward_env: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Build the context for a job; job variables win over the backend's base env
    pub fn new(job: &JobConfig, base_env: BTreeMap<String, String>, forward_env: Vec<String>) -> Self {
        let mut env = base_env;
        env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            job_index: job.index,
            identity: job.identity.clone(),
            grant: PrivilegeGrant::for_user(&job.identity.user),
            forward_env,
            env,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Expand `${VAR}` references against the current environment
    pub fn expand(&self, input: &str) -> String {
        expand_vars(input, &self.env)
    }

    pub fn principal(&self, run_as: RunAs) -> Principal {
        match run_as {
            RunAs::Root => Principal::Root,
            RunAs::Provisioned => Principal::User(self.identity.user.clone()),
        }
    }

    /// The subset of the environment allowed across the privilege boundary.
    ///
    /// Only keys in the pipeline allow-list or `extra` are forwarded; the
    /// identity's own HOME and USER are always set.
    pub fn forwarded_env(&self, extra: &[String]) -> BTreeMap<String, String> {
        let mut forwarded: BTreeMap<String, String> = self
            .forward_env
            .iter()
            .chain(extra.iter())
            .filter_map(|key| self.env.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        forwarded.insert("HOME".to_string(), self.identity.home.clone());
        forwarded.insert("USER".to_string(), self.identity.user.clone());
        forwarded
    }

    /// Build an invocation for a step against the current environment
    pub fn invocation_for(&self, step: &Step) -> Invocation {
        let env = match step.run_as {
            RunAs::Root => self.env.clone(),
            RunAs::Provisioned => self.forwarded_env(&step.pass_env),
        };

        Invocation {
            script: self.expand(&step.script),
            principal: self.principal(step.run_as),
            env,
            working_dir: step.working_dir.as_deref().map(|dir| self.expand(dir)),
            timeout: step.timeout,
        }
    }

    /// Apply a step's declared effects, returning what changed
    pub fn apply_effects(&mut self, effects: &EnvEffects) -> Vec<EnvChange> {
        let before = self.env.clone();
        effects.apply(&mut self.env);

        self.env
            .iter()
            .filter(|(key, value)| before.get(*key) != Some(*value))
            .map(|(key, value)| EnvChange::Set {
                name: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Apply a change requested by step output. Invalid names are ignored.
    pub fn apply_change(&mut self, change: &EnvChange) -> bool {
        match change {
            EnvChange::Set { name, value } => {
                if !is_env_name(name) {
                    return false;
                }
                self.env.insert(name.clone(), value.clone());
            }
            EnvChange::PrependPath(dir) => {
                if dir.is_empty() {
                    return false;
                }
                prepend_path(&mut self.env, dir);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indexmap::IndexMap;

    fn job() -> JobConfig {
        let mut env = BTreeMap::new();
        env.insert("PACKAGE".to_string(), "firedrake".to_string());
        env.insert("HOME_DIR".to_string(), "/home/firedrake".to_string());
        env.insert("SECRET".to_string(), "hunter2".to_string());
        JobConfig {
            index: 0,
            name: "BASE_IMAGE=ubuntu:16.04".to_string(),
            axes: IndexMap::new(),
            env,
            identity: Identity {
                user: "firedrake".to_string(),
                uid: 1000,
                gid: 1000,
                home: "/home/firedrake".to_string(),
            },
        }
    }

    fn context() -> ExecutionContext {
        let mut base = BTreeMap::new();
        base.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        ExecutionContext::new(&job(), base, vec!["PATH".to_string()])
    }

    #[test]
    fn test_grant_rule() {
        let grant = PrivilegeGrant::for_user("firedrake");
        assert_eq!(grant.rule, "firedrake ALL=(ALL) NOPASSWD: ALL");
        assert_eq!(grant.path, "/etc/sudoers.d/firedrake");
        assert_eq!(
            grant.install_script(),
            "mkdir -p /etc/sudoers.d && printf '%s\\n' 'firedrake ALL=(ALL) NOPASSWD: ALL' \
             > /etc/sudoers.d/firedrake && chmod 0440 /etc/sudoers.d/firedrake"
        );
    }

    #[test]
    fn test_root_invocation_sees_full_env() {
        let ctx = context();
        let invocation = ctx.invocation_for(&Step::new("lint", "make lint"));

        assert_eq!(invocation.principal, Principal::Root);
        assert_eq!(invocation.env.get("SECRET").unwrap(), "hunter2");
        assert_eq!(invocation.env.get("PATH").unwrap(), "/usr/bin:/bin");
    }

    #[test]
    fn test_provisioned_invocation_forwards_allow_list_only() {
        let ctx = context();
        let step = Step::new("test", "make test")
            .as_provisioned()
            .with_pass_env(&["PACKAGE", "UNSET"]);
        let invocation = ctx.invocation_for(&step);

        assert_eq!(invocation.principal, Principal::User("firedrake".to_string()));
        let keys: Vec<&str> = invocation.env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["HOME", "PACKAGE", "PATH", "USER"]);
        assert!(!invocation.env.contains_key("SECRET"));
    }

    #[test]
    fn test_invocation_expands_script_and_working_dir() {
        let ctx = context();
        let step = Step::new("install", "./install ${PACKAGE} ${UNKNOWN}")
            .with_working_dir("${HOME_DIR}");
        let invocation = ctx.invocation_for(&step);

        assert_eq!(invocation.script, "./install firedrake ${UNKNOWN}");
        assert_eq!(invocation.working_dir.as_deref(), Some("/home/firedrake"));
    }

    #[test]
    fn test_effects_are_visible_to_later_identity_steps() {
        let mut ctx = context();
        let changes = ctx.apply_effects(&EnvEffects {
            export: Vec::new(),
            prepend_path: vec!["${HOME_DIR}/firedrake/bin".to_string()],
        });
        assert_eq!(
            changes,
            vec![EnvChange::Set {
                name: "PATH".to_string(),
                value: "/home/firedrake/firedrake/bin:/usr/bin:/bin".to_string(),
            }]
        );

        let invocation = ctx.invocation_for(&Step::new("t", "pytest").as_provisioned());
        assert_eq!(
            invocation.env.get("PATH").unwrap(),
            "/home/firedrake/firedrake/bin:/usr/bin:/bin"
        );
    }

    #[test]
    fn test_apply_change_rejects_bad_names() {
        let mut ctx = context();
        assert!(!ctx.apply_change(&EnvChange::Set {
            name: "1BAD".to_string(),
            value: "x".to_string(),
        }));
        assert!(ctx.apply_change(&EnvChange::Set {
            name: "GOOD".to_string(),
            value: "x".to_string(),
        }));
        assert_eq!(ctx.get("GOOD"), Some("x"));
    }
}
