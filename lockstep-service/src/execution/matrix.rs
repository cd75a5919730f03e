// Matrix Expansion
// Expands matrix axes into concrete, independent job configurations

use crate::pipeline::models::{Isolation, MatrixAxis, Pipeline};

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// The unprivileged account a job's isolated work runs as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// How identities are assigned across jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// Every job uses the declared identity (each job has its own sandbox)
    Declared,
    /// Jobs share a host, so each gets a uid/gid/home offset by its index
    Distinct,
}

impl IdentityPolicy {
    pub fn for_isolation(isolation: &Isolation) -> Self {
        match isolation {
            Isolation::Host => IdentityPolicy::Distinct,
            Isolation::Container { .. } => IdentityPolicy::Declared,
        }
    }
}

/// One concrete job produced by matrix expansion; immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobConfig {
    /// Position in expansion order
    pub index: usize,
    /// Display name built from the axis assignment
    pub name: String,
    /// Axis name to the single value assigned to this job, in axis order
    pub axes: IndexMap<String, String>,
    /// Fixed environment plus axis values and identity keys
    pub env: BTreeMap<String, String>,
    pub identity: Identity,
}

impl JobConfig {
    pub fn axis(&self, name: &str) -> Option<&str> {
        self.axes.get(name).map(String::as_str)
    }
}

/// Matrix expander for pipelines
pub struct MatrixExpander;

impl MatrixExpander {
    /// Cartesian product of the axes in lexicographic product order.
    ///
    /// The first axis varies slowest and values keep their declared order.
    pub fn product(axes: &[MatrixAxis]) -> Vec<IndexMap<String, String>> {
        let mut combinations = vec![IndexMap::new()];

        for axis in axes {
            let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
            for combination in &combinations {
                for value in &axis.values {
                    let mut extended = combination.clone();
                    extended.insert(axis.name.clone(), value.clone());
                    next.push(extended);
                }
            }
            combinations = next;
        }

        combinations
    }

    /// Axis assignments after `exclude` and `include`, in job order
    pub fn assignments(pipeline: &Pipeline) -> Vec<IndexMap<String, String>> {
        let mut assignments: Vec<IndexMap<String, String>> = Self::product(&pipeline.axes)
            .into_iter()
            .filter(|assignment| !Self::is_excluded(assignment, &pipeline.exclude))
            .collect();

        for include in &pipeline.include {
            if !assignments.contains(include) {
                assignments.push(include.clone());
            }
        }
        assignments
    }

    /// Expand a resolved pipeline into job configurations
    pub fn expand(pipeline: &Pipeline) -> Vec<JobConfig> {
        let assignments = Self::assignments(pipeline);
        let policy = IdentityPolicy::for_isolation(&pipeline.isolation);
        let total = assignments.len();

        assignments
            .into_iter()
            .enumerate()
            .map(|(index, axes)| Self::build_job(pipeline, index, total, axes, policy))
            .collect()
    }

    fn is_excluded(
        assignment: &IndexMap<String, String>,
        exclude: &[IndexMap<String, String>],
    ) -> bool {
        exclude.iter().any(|rule| {
            !rule.is_empty()
                && rule
                    .iter()
                    .all(|(axis, value)| assignment.get(axis) == Some(value))
        })
    }

    fn build_job(
        pipeline: &Pipeline,
        index: usize,
        total: usize,
        axes: IndexMap<String, String>,
        policy: IdentityPolicy,
    ) -> JobConfig {
        let identity = Self::identity_for(pipeline, index, total, policy);

        let mut env = pipeline.environment.vars.clone();
        for (axis, value) in &axes {
            env.insert(axis.clone(), value.clone());
        }
        env.insert("HOME_DIR".to_string(), identity.home.clone());
        env.insert("TEST_UID".to_string(), identity.uid.to_string());
        env.insert("TEST_GID".to_string(), identity.gid.to_string());
        env.insert("TEST_USER".to_string(), identity.user.clone());

        let name = axes
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect::<Vec<_>>()
            .join(", ");

        JobConfig {
            index,
            name,
            axes,
            env,
            identity,
        }
    }

    fn identity_for(
        pipeline: &Pipeline,
        index: usize,
        total: usize,
        policy: IdentityPolicy,
    ) -> Identity {
        let environment = &pipeline.environment;
        let user = pipeline.provision.user.clone();

        if policy == IdentityPolicy::Declared || total <= 1 {
            return Identity {
                user,
                uid: environment.uid,
                gid: environment.gid,
                home: environment.home.clone(),
            };
        }

        // The validator rejects environments whose offsets would leave the u32 range
        let offset = u32::try_from(index).unwrap_or(u32::MAX);
        Identity {
            user: format!("{}{}", user, index),
            uid: environment.uid.saturating_add(offset),
            gid: environment.gid.saturating_add(offset),
            home: format!("{}-{}", environment.home.trim_end_matches('/'), index),
        }
    }
}
