use awf_config::SchemaError;

use crate::firewall::PolicyCompilationError;
use crate::orchestrator::LifecycleStep;
use crate::seccomp::SeccompValidationError;

/// Failure of a sandbox run before the agent produced an exit code.
///
/// A nonzero agent exit is not represented here; it is the normal outcome of
/// [`SandboxOrchestrator::run`](crate::SandboxOrchestrator::run).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("policy compilation failed: {0}")]
    PolicyCompilation(#[from] PolicyCompilationError),

    #[error("seccomp profile rejected: {0}")]
    Seccomp(#[from] SeccompValidationError),

    #[error("{step} failed: {source:#}")]
    Provisioning {
        step: LifecycleStep,
        #[source]
        source: anyhow::Error,
    },
}

impl SandboxError {
    pub(crate) fn provisioning(step: LifecycleStep, source: anyhow::Error) -> Self {
        Self::Provisioning { step, source }
    }

    /// True when the error was raised before any host side effect.
    pub fn is_preflight(&self) -> bool {
        !matches!(self, Self::Provisioning { .. })
    }

    /// The lifecycle step that failed, for provisioning errors.
    pub fn step(&self) -> Option<LifecycleStep> {
        match self {
            Self::Provisioning { step, .. } => Some(*step),
            _ => None,
        }
    }
}
