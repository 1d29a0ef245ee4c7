//! Scripted in-memory [`SandboxRuntime`] for service tests: failure
//! injection at each lifecycle step and hand-driven agent processes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use sandbox::{
    ExecHandle, ExecOutput, ExecRequest, ProcessControl, SandboxError, SandboxRuntime,
    SandboxSpec, SandboxState,
};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

pub(crate) struct FakeRuntime {
    containers: Mutex<HashMap<String, SandboxState>>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_exec: AtomicBool,
    /// When set, `create` never returns; provisioning must hit its timeout.
    pub hang_create: AtomicBool,
    exec_held: AtomicBool,
    exec_gate: Notify,
    /// Exit code returned by `exec_collect` (the clone step).
    pub collect_exit_code: AtomicI64,
    /// When set, spawned processes ignore SIGTERM and only die on kill.
    pub ignore_terminate: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            processes: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            hang_create: AtomicBool::new(false),
            exec_held: AtomicBool::new(false),
            exec_gate: Notify::new(),
            collect_exit_code: AtomicI64::new(0),
            ignore_terminate: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, sandbox_id: &str, state: SandboxState) {
        self.lock_containers()
            .insert(sandbox_id.to_string(), state);
    }

    pub fn state_of(&self, sandbox_id: &str) -> Option<SandboxState> {
        self.lock_containers().get(sandbox_id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.lock_containers().len()
    }

    /// Most recently spawned agent process.
    pub fn latest_process(&self) -> Option<Arc<FakeProcess>> {
        lock(&self.processes).last().cloned()
    }

    /// Make `exec` block until [`FakeRuntime::release_exec`] is called.
    pub fn hold_exec(&self) {
        self.exec_held.store(true, Ordering::SeqCst);
    }

    pub fn release_exec(&self) {
        self.exec_held.store(false, Ordering::SeqCst);
        self.exec_gate.notify_waiters();
    }

    fn lock_containers(&self) -> MutexGuard<'_, HashMap<String, SandboxState>> {
        lock(&self.containers)
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        if self.hang_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::ResourceExhausted(
                "no space left on device".to_string(),
            ));
        }
        spec.validate()?;
        self.lock_containers()
            .insert(spec.name.clone(), SandboxState::Created);
        Ok(spec.name.clone())
    }

    async fn start(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::CommandFailed("start failed".to_string()));
        }
        let mut containers = self.lock_containers();
        match containers.get_mut(sandbox_id) {
            Some(state) => {
                *state = SandboxState::Running;
                Ok(())
            }
            None => Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
    }

    async fn stop(&self, sandbox_id: &str, _timeout_secs: u64) -> Result<(), SandboxError> {
        let mut containers = self.lock_containers();
        match containers.get_mut(sandbox_id) {
            Some(state) => {
                *state = SandboxState::Exited;
                Ok(())
            }
            None => Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
    }

    async fn remove(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.lock_containers().remove(sandbox_id);
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        _request: &ExecRequest,
    ) -> Result<ExecHandle, SandboxError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(SandboxError::CommandFailed(
                "exec failed to spawn".to_string(),
            ));
        }
        loop {
            if !self.exec_held.load(Ordering::SeqCst) {
                break;
            }
            let released = self.exec_gate.notified();
            if !self.exec_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        match self.state_of(sandbox_id) {
            Some(SandboxState::Running) => {}
            Some(_) => return Err(SandboxError::NotRunning(sandbox_id.to_string())),
            None => return Err(SandboxError::NotFound(sandbox_id.to_string())),
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let process = Arc::new(FakeProcess {
            sender: Mutex::new(Some(sender)),
            terminate_requested: CancellationToken::new(),
            kill_requested: CancellationToken::new(),
            ignore_terminate: self.ignore_terminate.load(Ordering::SeqCst),
            exit_code: Mutex::new(None),
            exit_notify: Notify::new(),
        });
        lock(&self.processes).push(process.clone());
        Ok(ExecHandle {
            output: Box::pin(UnboundedReceiverStream::new(receiver)),
            control: Box::new(FakeControl(process)),
        })
    }

    async fn exec_collect(
        &self,
        sandbox_id: &str,
        _request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        if self.state_of(sandbox_id).is_none() {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        let exit_code = self.collect_exit_code.load(Ordering::SeqCst);
        let stderr = if exit_code == 0 {
            String::new()
        } else {
            "fatal: could not read from remote repository".to_string()
        };
        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr,
        })
    }

    async fn inspect(&self, sandbox_id: &str) -> Result<SandboxState, SandboxError> {
        self.state_of(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))
    }
}

pub(crate) struct FakeProcess {
    sender: Mutex<Option<mpsc::UnboundedSender<std::io::Result<String>>>>,
    pub terminate_requested: CancellationToken,
    pub kill_requested: CancellationToken,
    ignore_terminate: bool,
    exit_code: Mutex<Option<i32>>,
    exit_notify: Notify,
}

impl FakeProcess {
    pub fn push_line(&self, line: &str) {
        if let Some(sender) = &*lock(&self.sender) {
            let _ = sender.send(Ok(line.to_string()));
        }
    }

    /// End the process: the output stream closes and waiters wake.
    pub fn exit(&self, code: i32) {
        lock(&self.sender).take();
        lock(&self.exit_code).get_or_insert(code);
        self.exit_notify.notify_waiters();
    }

    pub fn has_exited(&self) -> bool {
        lock(&self.exit_code).is_some()
    }
}

struct FakeControl(Arc<FakeProcess>);

#[async_trait]
impl ProcessControl for FakeControl {
    async fn terminate(&self) -> Result<(), SandboxError> {
        self.0.terminate_requested.cancel();
        if !self.0.ignore_terminate {
            self.0.exit(143);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.0.kill_requested.cancel();
        self.0.exit(137);
        Ok(())
    }

    async fn wait(&self) -> Result<Option<i32>, SandboxError> {
        loop {
            let notified = self.0.exit_notify.notified();
            if let Some(code) = *lock(&self.0.exit_code) {
                return Ok(Some(code));
            }
            notified.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
