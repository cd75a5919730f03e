// Scripted backend used by the execution tests
// Records every invocation and answers with canned outputs matched by script substring

use crate::error::RunnerError;
use crate::execution::matrix::JobConfig;
use crate::runners::process::CommandOutput;
use crate::runners::{Backend, CommandRunner, Invocation, OutputCallback, SYSTEM_PATH};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub job: usize,
    pub invocation: Invocation,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    rules: Arc<Vec<(String, CommandOutput)>>,
    log: Arc<Mutex<Vec<Recorded>>>,
    shutdowns: Arc<Mutex<Vec<usize>>>,
    fail_open: Option<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any script containing `pattern` with `output` (first match wins)
    pub fn on(mut self, pattern: &str, output: CommandOutput) -> Self {
        let mut rules = (*self.rules).clone();
        rules.push((pattern.to_string(), output));
        self.rules = Arc::new(rules);
        self
    }

    /// Fail scripts containing `pattern` with the given exit code
    pub fn fail_on(self, pattern: &str, exit_code: i32) -> Self {
        self.on(pattern, CommandOutput::with_exit_code(exit_code))
    }

    /// Make opening the context fail for one job
    pub fn fail_open(mut self, job: usize) -> Self {
        self.fail_open = Some(job);
        self
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn scripts_for(&self, job: usize) -> Vec<String> {
        self.recorded()
            .into_iter()
            .filter(|r| r.job == job)
            .map(|r| r.invocation.script)
            .collect()
    }

    pub fn shutdowns(&self) -> Vec<usize> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn runner(&self, job: usize) -> ScriptedRunner {
        ScriptedRunner {
            job,
            backend: self.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for ScriptedBackend {
    fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
        env
    }

    async fn open(&self, job: &JobConfig) -> Result<Box<dyn CommandRunner>, RunnerError> {
        if self.fail_open == Some(job.index) {
            return Err(RunnerError::SandboxStart {
                image: job.name.clone(),
                message: "no such image".to_string(),
            });
        }
        Ok(Box::new(self.runner(job.index)))
    }
}

pub struct ScriptedRunner {
    job: usize,
    backend: ScriptedBackend,
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation, on_output: Option<OutputCallback>) -> CommandOutput {
        self.backend.log.lock().unwrap().push(Recorded {
            job: self.job,
            invocation: invocation.clone(),
        });

        let output = self
            .backend
            .rules
            .iter()
            .find(|(pattern, _)| invocation.script.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::with_exit_code(0));

        if let Some(callback) = on_output {
            for line in output.stdout.lines() {
                callback(line, false);
            }
        }
        output
    }

    async fn shutdown(&self) -> Result<(), RunnerError> {
        self.backend.shutdowns.lock().unwrap().push(self.job);
        Ok(())
    }
}
