use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

/// Logical grouping for commands issued against the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    Firewall,
    Compose,
    Container,
}

/// Whether the child's stdout/stderr are captured or streamed to ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Capture,
    Inherit,
}

/// Describes a command that will be executed by a [`CommandExecutor`].
///
/// Programs are run directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub category: CommandCategory,
    pub working_dir: Option<PathBuf>,
    pub output: OutputMode,
}

impl CommandInvocation {
    pub fn new<I, S>(category: CommandCategory, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            category,
            working_dir: None,
            output: OutputMode::Capture,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.output = OutputMode::Inherit;
        self
    }

    /// Shell-quoted rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Captured result of one host command.
///
/// `exit_code` is `None` when the child was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero or signalled exit into an error naming the command.
    pub fn ensure_success(self, invocation: &CommandInvocation) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let code = self
            .exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        let detail = self.stderr.trim();
        if detail.is_empty() {
            bail!("`{}` exited with status {code}", invocation.display());
        }
        bail!("`{}` exited with status {code}: {detail}", invocation.display());
    }
}

/// Trait implemented by concrete command execution strategies.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &CommandInvocation) -> Result<CommandOutput>;
}

/// Executes commands as child processes via [`tokio::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl ProcessCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        // A cancelled run must not leave `compose up` or `logs -f` behind.
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        let failed = || format!("failed to execute command: {}", invocation.display());

        match invocation.output {
            OutputMode::Capture => {
                let output = cmd.output().await.with_context(failed)?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            OutputMode::Inherit => {
                let status = cmd
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()
                    .await
                    .with_context(failed)?;
                Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }
}
