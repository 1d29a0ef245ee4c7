//! Sandbox runtime abstraction.
//!
//! Everything the orchestration layer knows about containers goes through
//! [`SandboxRuntime`]. The runtime is treated as fallible and slow: a call
//! that succeeded once proves nothing later, so callers re-verify with
//! [`SandboxRuntime::inspect`] before decisions that depend on liveness.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub mod config;
pub mod docker;

pub use config::SandboxConfig;
pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Sandbox is not running: {0}")]
    NotRunning(String),
    #[error("Sandbox is already running: {0}")]
    AlreadyRunning(String),
    #[error("Invalid sandbox spec: {0}")]
    InvalidSpec(String),
    #[error("Sandbox resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Sandbox command failed: {0}")]
    CommandFailed(String),
    #[error("Sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Container state as reported by the runtime. Unrecognized states are
/// preserved verbatim rather than collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SandboxState {
    Created,
    Running,
    Exited,
    #[strum(default)]
    Unknown(String),
}

impl SandboxState {
    pub fn is_running(&self) -> bool {
        matches!(self, SandboxState::Running)
    }
}

/// Everything needed to create a sandbox for one project.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name, unique per project.
    pub name: String,
    pub image: String,
    /// Host directory mounted at /workspace inside the sandbox.
    pub workspace_dir: PathBuf,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
    pub network: Option<String>,
    pub env: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.name.trim().is_empty() {
            return Err(SandboxError::InvalidSpec("name must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(SandboxError::InvalidSpec("image must not be empty".into()));
        }
        Ok(())
    }
}

/// A command to run inside a sandbox. `command` is passed to `sh -c`, so
/// callers are responsible for quoting embedded arguments.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Collected output of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Control handle for a process started with [`SandboxRuntime::exec`].
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit (SIGTERM). Safe to call after exit.
    async fn terminate(&self) -> Result<(), SandboxError>;
    /// Forcibly end the process (SIGKILL).
    async fn kill(&self) -> Result<(), SandboxError>;
    /// Wait for exit, returning the exit code when the platform reports one.
    async fn wait(&self) -> Result<Option<i32>, SandboxError>;
}

/// A running command: its merged stdout/stderr line stream plus control.
pub struct ExecHandle {
    pub output: BoxStream<'static, std::io::Result<String>>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Allocate a sandbox, returning its runtime id. Does not start it.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    async fn start(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Graceful stop with a bounded wait before the runtime forces exit.
    async fn stop(&self, sandbox_id: &str, timeout_secs: u64) -> Result<(), SandboxError>;

    /// Force removal. Succeeds whether or not the sandbox is running.
    async fn remove(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Start a long-lived process inside the sandbox.
    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecHandle, SandboxError>;

    /// Run a command to completion and collect its output.
    async fn exec_collect(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError>;

    /// Query the current state. This is the only source of truth about
    /// sandbox liveness.
    async fn inspect(&self, sandbox_id: &str) -> Result<SandboxState, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses_known_and_unknown_values() {
        assert_eq!("running".parse(), Ok(SandboxState::Running));
        assert_eq!("exited".parse(), Ok(SandboxState::Exited));
        assert_eq!(
            "restarting".parse(),
            Ok(SandboxState::Unknown("restarting".to_string()))
        );
        assert!(!SandboxState::Exited.is_running());
    }

    #[test]
    fn spec_validation_rejects_blank_fields() {
        let spec = SandboxSpec {
            name: " ".to_string(),
            image: "img".to_string(),
            workspace_dir: PathBuf::from("/tmp/w"),
            memory_limit: None,
            cpu_limit: None,
            network: None,
            env: Vec::new(),
        };
        assert!(matches!(
            spec.validate(),
            Err(SandboxError::InvalidSpec(_))
        ));
    }
}
