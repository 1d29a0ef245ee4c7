//! [`SandboxRuntime`] backed by the `docker` CLI.

use std::{env, ffi::OsStr, process::Stdio};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
};
use tokio_stream::wrappers::LinesStream;

use crate::{
    ExecHandle, ExecOutput, ExecRequest, ProcessControl, SandboxError, SandboxRuntime,
    SandboxSpec, SandboxState,
};

pub struct DockerRuntime {
    docker_bin: String,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon, probing that it is reachable.
    pub async fn new() -> Result<Self, SandboxError> {
        let docker_bin = env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        let runtime = Self { docker_bin };
        runtime
            .run(["version", "--format", "{{.Server.Version}}"], None)
            .await
            .map_err(|err| SandboxError::Unavailable(err.to_string()))?;
        Ok(runtime)
    }

    /// Execute `docker <args>` and return trimmed stdout on success.
    async fn run<I, S>(&self, args: I, sandbox_id: Option<&str>) -> Result<String, SandboxError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::debug!(stderr, "docker command failed");
        Err(classify(sandbox_id, stderr))
    }

    fn spawn_exec(&self, args: Vec<String>) -> Result<Child, SandboxError> {
        let child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        spec.validate()?;
        self.run(create_args(spec), Some(&spec.name)).await
    }

    async fn start(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.run(["start", sandbox_id], Some(sandbox_id)).await?;
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str, timeout_secs: u64) -> Result<(), SandboxError> {
        self.run(
            ["stop", "-t", &timeout_secs.to_string(), sandbox_id],
            Some(sandbox_id),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.run(["rm", "-f", sandbox_id], Some(sandbox_id)).await?;
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecHandle, SandboxError> {
        let mut child = self.spawn_exec(exec_args(sandbox_id, request))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::CommandFailed("failed to capture exec stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SandboxError::CommandFailed("failed to capture exec stderr".to_string())
        })?;
        let stdout_lines = LinesStream::new(BufReader::new(stdout).lines());
        let stderr_lines = LinesStream::new(BufReader::new(stderr).lines());
        let merged = tokio_stream::StreamExt::merge(stdout_lines, stderr_lines);

        let pid = child.id();
        Ok(ExecHandle {
            output: Box::pin(merged),
            control: Box::new(DockerExecControl {
                pid,
                child: Mutex::new(child),
            }),
        })
    }

    async fn exec_collect(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        let output = Command::new(&self.docker_bin)
            .args(exec_args(sandbox_id, request))
            .stdin(Stdio::null())
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if let Some(code) = output.status.code() {
            Ok(ExecOutput {
                exit_code: code as i64,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr,
            })
        } else {
            Err(classify(Some(sandbox_id), stderr.trim().to_string()))
        }
    }

    async fn inspect(&self, sandbox_id: &str) -> Result<SandboxState, SandboxError> {
        let raw = self
            .run(
                ["inspect", "--format", "{{.State.Status}}", sandbox_id],
                Some(sandbox_id),
            )
            .await?;
        Ok(raw
            .parse()
            .unwrap_or_else(|_| SandboxState::Unknown(raw.clone())))
    }
}

struct DockerExecControl {
    /// Pid of the docker exec client, captured at spawn.
    pid: Option<u32>,
    child: Mutex<Child>,
}

#[async_trait]
impl ProcessControl for DockerExecControl {
    async fn terminate(&self) -> Result<(), SandboxError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(SandboxError::CommandFailed(format!(
                "failed to signal process {pid}: {err}"
            ))),
        }
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => Ok(()),
            // Already exited.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(SandboxError::Io(err)),
        }
    }

    async fn wait(&self) -> Result<Option<i32>, SandboxError> {
        let status = self.child.lock().await.wait().await?;
        Ok(status.code())
    }
}

fn create_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if let Some(memory) = &spec.memory_limit {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(cpus) = spec.cpu_limit {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-v".to_string());
    args.push(format!("{}:/workspace", spec.workspace_dir.display()));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push(spec.image.clone());
    // Keep the container alive; work happens through exec.
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

fn exec_args(sandbox_id: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(dir) = &request.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(sandbox_id.to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(request.command.clone());
    args
}

fn classify(sandbox_id: Option<&str>, stderr: String) -> SandboxError {
    let id = sandbox_id.unwrap_or("<unknown>");
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        SandboxError::NotFound(id.to_string())
    } else if lower.contains("is not running") {
        SandboxError::NotRunning(id.to_string())
    } else if lower.contains("already in use") {
        SandboxError::AlreadyRunning(id.to_string())
    } else if lower.contains("no space left") || lower.contains("cannot allocate memory") {
        SandboxError::ResourceExhausted(stderr)
    } else {
        SandboxError::CommandFailed(stderr)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            name: "agent-sbx-p1".to_string(),
            image: "agent-base:latest".to_string(),
            workspace_dir: PathBuf::from("/tmp/agent-workspaces/p1"),
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some(2.0),
            network: None,
            env: vec![("FOO".to_string(), "bar".to_string())],
        }
    }

    #[test]
    fn create_args_cover_limits_mount_and_env() {
        let args = create_args(&spec());
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--name", "agent-sbx-p1"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "2g"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
        assert!(args.windows(2).any(|w| w == ["-e", "FOO=bar"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["-v", "/tmp/agent-workspaces/p1:/workspace"])
        );
        assert_eq!(&args[args.len() - 3..], ["agent-base:latest", "sleep", "infinity"]);
    }

    #[test]
    fn exec_args_run_through_shell() {
        let request = ExecRequest::shell("git status").in_dir("/workspace/repo");
        let args = exec_args("sbx-1", &request);
        assert_eq!(
            args,
            vec!["exec", "-w", "/workspace/repo", "sbx-1", "sh", "-c", "git status"]
        );
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify(Some("sbx-1"), "Error: No such container: sbx-1".to_string()),
            SandboxError::NotFound(_)
        ));
        assert!(matches!(
            classify(Some("sbx-1"), "container sbx-1 is not running".to_string()),
            SandboxError::NotRunning(_)
        ));
        assert!(matches!(
            classify(
                Some("sbx-1"),
                "the container name \"/sbx-1\" is already in use".to_string()
            ),
            SandboxError::AlreadyRunning(_)
        ));
        assert!(matches!(
            classify(None, "write /var/lib: no space left on device".to_string()),
            SandboxError::ResourceExhausted(_)
        ));
        assert!(matches!(
            classify(None, "something else".to_string()),
            SandboxError::CommandFailed(_)
        ));
    }
}
