use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::docker::DockerHost;
use super::executor::{CommandExecutor, CommandInvocation, CommandOutput};

/// Records every command and answers from a prefix-keyed script.
///
/// The first matching failure wins over any scripted stdout; unscripted
/// commands succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    failures: Vec<(&'static str, i32)>,
    stdout: Vec<(&'static str, String)>,
}

impl ScriptedExecutor {
    pub(crate) fn failing(mut self, prefix: &'static str) -> Self {
        self.failures.push((prefix, 1));
        self
    }

    pub(crate) fn answering(mut self, prefix: &'static str, stdout: impl Into<String>) -> Self {
        self.stdout.push((prefix, stdout.into()));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        let line = invocation.display();
        self.calls.lock().unwrap().push(line.clone());
        if let Some((_, code)) = self.failures.iter().find(|(p, _)| line.starts_with(p)) {
            return Ok(CommandOutput::failure(*code, "scripted failure"));
        }
        let stdout = self
            .stdout
            .iter()
            .find(|(p, _)| line.starts_with(p))
            .map_or("", |(_, out)| out.as_str());
        Ok(CommandOutput::success(stdout))
    }
}

pub(crate) fn scripted_host(executor: ScriptedExecutor) -> DockerHost<ScriptedExecutor> {
    DockerHost::new(executor, BTreeMap::new())
}
