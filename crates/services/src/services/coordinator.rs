//! Run coordination: the state machine that starts, supervises, stops and
//! resumes agent runs.
//!
//! One supervision task exists per active run. It owns the agent process
//! handle, pumps output through the run's log relay, polls sandbox liveness,
//! and performs the single terminal transition for the run. Terminal
//! transitions are compare-and-swap updates in the ledger, so a race between
//! two paths (agent exit vs. operator stop) has exactly one winner.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use db::{
    DBService,
    models::{
        project::{Project, ProjectStatus},
        run::{CreateRun, Run, RunStatus},
    },
};
use futures::{StreamExt, stream::BoxStream};
use sandbox::{ExecHandle, ExecRequest, SandboxError, SandboxRuntime};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::{
    config::OrchestratorConfig,
    consistency::ConsistencyChecker,
    locks::ProjectLocks,
    relay::{AgentSignal, LogEvent, LogEventKind, LogRelay},
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Run not found")]
    RunNotFound,
    #[error("Project is not ready (status: {0})")]
    ProjectNotReady(ProjectStatus),
    #[error("A run is already active for this project")]
    RunAlreadyActive,
    #[error("Cannot {operation} a run in status {status}")]
    InvalidTransition {
        operation: &'static str,
        status: RunStatus,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct RunCoordinator {
    db: DBService,
    runtime: Arc<dyn SandboxRuntime>,
    checker: ConsistencyChecker,
    config: OrchestratorConfig,
    locks: ProjectLocks,
    /// Active and recently finished runs. Finished entries stick around so
    /// late subscribers can still read the buffered tail; they are evicted
    /// when the next run starts for the same project.
    active: DashMap<Uuid, ActiveRun>,
}

#[derive(Clone)]
struct ActiveRun {
    project_id: Uuid,
    relay: Arc<LogRelay>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl RunCoordinator {
    pub fn new(
        db: DBService,
        runtime: Arc<dyn SandboxRuntime>,
        config: OrchestratorConfig,
        locks: ProjectLocks,
    ) -> Self {
        let checker = ConsistencyChecker::new(runtime.clone());
        Self {
            db,
            runtime,
            checker,
            config,
            locks,
            active: DashMap::new(),
        }
    }

    /// Start a fresh run for the project. At most one run per project may be
    /// in flight; concurrent callers race for the per-project lock and every
    /// loser gets `RunAlreadyActive`.
    pub async fn start_run(
        &self,
        project_id: Uuid,
        task: &str,
        phase: Option<String>,
    ) -> Result<Run, CoordinatorError> {
        let lock = self.locks.get(project_id);
        let _guard = lock.lock().await;

        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(CoordinatorError::ProjectNotFound)?;
        if project.status != ProjectStatus::Ready {
            return Err(CoordinatorError::ProjectNotReady(project.status));
        }
        if Run::find_running(&self.db.pool, project_id).await?.is_some() {
            return Err(CoordinatorError::RunAlreadyActive);
        }

        let run = Run::create(
            &self.db.pool,
            &CreateRun {
                project_id,
                phase: phase.unwrap_or_else(|| "plan".to_string()),
                conversation_id: Uuid::new_v4(),
            },
            Uuid::new_v4(),
        )
        .await?;
        self.launch(&project, run, Some(task)).await
    }

    /// Start a new run that continues a stopped or failed run's
    /// conversation. The prior row is never modified.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        let prior = Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)?;
        if !prior.status.is_resumable() {
            return Err(CoordinatorError::InvalidTransition {
                operation: "resume",
                status: prior.status,
            });
        }

        let lock = self.locks.get(prior.project_id);
        let _guard = lock.lock().await;

        let project = Project::find_by_id(&self.db.pool, prior.project_id)
            .await?
            .ok_or(CoordinatorError::ProjectNotFound)?;
        if project.status != ProjectStatus::Ready {
            return Err(CoordinatorError::ProjectNotReady(project.status));
        }
        if Run::find_running(&self.db.pool, prior.project_id)
            .await?
            .is_some()
        {
            return Err(CoordinatorError::RunAlreadyActive);
        }

        let run = Run::create(
            &self.db.pool,
            &CreateRun {
                project_id: prior.project_id,
                phase: prior.phase.clone(),
                conversation_id: prior.conversation_id,
            },
            Uuid::new_v4(),
        )
        .await?;
        self.launch(&project, run, None).await
    }

    /// Request a stop and wait (bounded) for the supervisor to finish the
    /// run. Stopping an already terminal run is a no-op that returns the
    /// current row.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        let run = Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let entry = self
            .active
            .get(&run_id)
            .map(|e| (e.cancel.clone(), e.finished.clone()));
        match entry {
            Some((cancel, mut finished)) => {
                cancel.cancel();
                let bound = self.config.stop_grace + Duration::from_secs(5);
                match timeout(bound, finished.wait_for(|done| *done)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::warn!(%run_id, "timed out waiting for run to stop");
                    }
                }
            }
            None => {
                // No supervisor in this process; transition the row directly.
                if !Run::finish_if(&self.db.pool, run_id, run.status, RunStatus::Stopped, None, None)
                    .await?
                {
                    tracing::warn!(%run_id, "stop raced with another transition");
                }
            }
        }
        Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)
    }

    pub async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, CoordinatorError> {
        Ok(Run::find_by_project(&self.db.pool, project_id).await?)
    }

    /// The project's current run: its unique running run if one exists,
    /// otherwise the latest by iteration.
    pub async fn current_run(&self, project_id: Uuid) -> Result<Option<Run>, CoordinatorError> {
        Ok(Run::current_for_project(&self.db.pool, project_id).await?)
    }

    /// Subscribe to a run's log events: buffered backfill first, then live
    /// events until the run terminates. For runs whose relay is gone (e.g.
    /// after a restart) the final status is synthesized from the ledger.
    pub async fn subscribe(
        &self,
        run_id: Uuid,
    ) -> Result<BoxStream<'static, LogEvent>, CoordinatorError> {
        if let Some(entry) = self.active.get(&run_id) {
            return Ok(entry.relay.subscribe());
        }
        let run = Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)?;
        let event = LogEvent {
            seq: 0,
            run_id,
            kind: LogEventKind::Status {
                status: run.status.to_string(),
                error: run.error_message,
                artifact: run.artifact_path,
            },
            timestamp: run.finished_at.unwrap_or(run.created_at),
        };
        Ok(futures::stream::iter(vec![event]).boxed())
    }

    /// Fail any run left in a non-terminal state by a previous process.
    /// Called once at startup, before the server accepts commands.
    pub async fn cleanup_orphan_runs(&self) -> Result<u64, CoordinatorError> {
        let count = Run::fail_all_active(&self.db.pool, "orphaned by restart").await?;
        if count > 0 {
            tracing::warn!(count, "failed orphaned runs from previous process");
        }
        Ok(count)
    }

    /// Launch the agent process and hand the run to a supervision task.
    /// Callers hold the project lock.
    async fn launch(
        &self,
        project: &Project,
        run: Run,
        task: Option<&str>,
    ) -> Result<Run, CoordinatorError> {
        let sandbox_id = project
            .sandbox_id
            .clone()
            .ok_or(CoordinatorError::ProjectNotReady(project.status))?;
        let command = agent_command(&self.config.agent_command, &run, task)?;
        let request = ExecRequest::shell(command).in_dir("/workspace/repo");

        let handle = match self.runtime.exec(&sandbox_id, &request).await {
            Ok(handle) => handle,
            Err(err) => {
                let message = format!("failed to launch agent: {err}");
                if !Run::finish_if(
                    &self.db.pool,
                    run.id,
                    RunStatus::Created,
                    RunStatus::Failed,
                    Some(&message),
                    None,
                )
                .await?
                {
                    tracing::warn!(run_id = %run.id, "launch failure raced with another transition");
                }
                return Err(err.into());
            }
        };

        if !Run::mark_running(&self.db.pool, run.id).await? {
            // Lost the created->running CAS, e.g. to a stop request that
            // arrived mid-launch. Report the state the row actually reached.
            let _ = handle.control.kill().await;
            let current = Run::find_by_id(&self.db.pool, run.id)
                .await?
                .ok_or(CoordinatorError::RunNotFound)?;
            return Err(CoordinatorError::InvalidTransition {
                operation: "launch",
                status: current.status,
            });
        }

        let relay = Arc::new(LogRelay::new(run.id, self.config.relay_capacity));
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);

        // Evict finished entries from earlier runs of this project.
        self.active
            .retain(|_, entry| entry.project_id != project.id || !*entry.finished.borrow());
        self.active.insert(
            run.id,
            ActiveRun {
                project_id: project.id,
                relay: relay.clone(),
                cancel: cancel.clone(),
                finished: finished_rx,
            },
        );
        relay.clone().spawn_heartbeat(self.config.heartbeat_interval);

        let ctx = SuperviseCtx {
            db: self.db.clone(),
            checker: self.checker.clone(),
            relay,
            cancel,
            finished: finished_tx,
            run_id: run.id,
            project_id: project.id,
            sandbox_id,
            liveness_poll: self.config.liveness_poll_interval,
            stop_grace: self.config.stop_grace,
        };
        tokio::spawn(supervise(ctx, handle));
        tracing::info!(run_id = %run.id, project_id = %project.id, "run started");

        Run::find_by_id(&self.db.pool, run.id)
            .await?
            .ok_or(CoordinatorError::RunNotFound)
    }
}

struct SuperviseCtx {
    db: DBService,
    checker: ConsistencyChecker,
    relay: Arc<LogRelay>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
    run_id: Uuid,
    project_id: Uuid,
    sandbox_id: String,
    liveness_poll: Duration,
    stop_grace: Duration,
}

enum RunEnd {
    /// The agent reported its own outcome before exiting.
    Agent(AgentSignal),
    /// Stop was requested; the process is gone.
    Stopped,
    /// The stream ended with no signal and no stop request.
    Vanished,
    /// The liveness poll found the sandbox gone or not running.
    Diverged(String),
}

async fn supervise(ctx: SuperviseCtx, handle: ExecHandle) {
    let ExecHandle {
        mut output,
        control,
    } = handle;
    let mut signal: Option<AgentSignal> = None;
    let mut stopping = false;
    let mut kill_deadline: Option<Instant> = None;
    let mut liveness = tokio::time::interval(ctx.liveness_poll);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let end = loop {
        let kill_at = kill_deadline.unwrap_or_else(far_future);
        tokio::select! {
            line = output.next() => match line {
                Some(Ok(line)) => {
                    if let Some(s) = ctx.relay.push_line(&line) {
                        signal = Some(s);
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(run_id = %ctx.run_id, %err, "error reading agent output");
                }
                None => {
                    // A stop request beats a terminal signal that arrived
                    // while the stop was already in flight.
                    if stopping {
                        break RunEnd::Stopped;
                    }
                    break match signal.take() {
                        Some(signal) => RunEnd::Agent(signal),
                        None => RunEnd::Vanished,
                    };
                }
            },
            _ = ctx.cancel.cancelled(), if !stopping => {
                stopping = true;
                if let Err(err) = control.terminate().await {
                    tracing::warn!(run_id = %ctx.run_id, %err, "terminate failed");
                }
                kill_deadline = Some(Instant::now() + ctx.stop_grace);
            },
            _ = tokio::time::sleep_until(kill_at), if kill_deadline.is_some() => {
                kill_deadline = None;
                tracing::warn!(run_id = %ctx.run_id, "agent ignored terminate, killing");
                if let Err(err) = control.kill().await {
                    tracing::warn!(run_id = %ctx.run_id, %err, "kill failed");
                }
            },
            _ = liveness.tick(), if !stopping => {
                match ctx.checker.sandbox_is_live(&ctx.sandbox_id, ctx.project_id).await {
                    Ok(true) => {}
                    Ok(false) => break RunEnd::Diverged(format!(
                        "sandbox {} is no longer running",
                        ctx.sandbox_id
                    )),
                    Err(err) => {
                        tracing::warn!(run_id = %ctx.run_id, %err, "liveness check failed");
                    }
                }
            }
        }
    };

    let (status, error, artifact) = match end {
        RunEnd::Agent(AgentSignal::Done { artifact }) => (RunStatus::Done, None, artifact),
        RunEnd::Agent(AgentSignal::Failed { error }) => (
            RunStatus::Failed,
            Some(error.unwrap_or_else(|| "agent reported failure".to_string())),
            None,
        ),
        RunEnd::Stopped => (RunStatus::Stopped, None, None),
        RunEnd::Vanished => {
            let code = timeout(Duration::from_secs(2), control.wait())
                .await
                .ok()
                .and_then(|result| result.ok())
                .flatten();
            let message = match code {
                Some(code) => {
                    format!("agent process terminated unexpectedly (exit code {code})")
                }
                None => "agent process terminated unexpectedly".to_string(),
            };
            (RunStatus::Failed, Some(message), None)
        }
        RunEnd::Diverged(message) => {
            if let Err(err) = control.kill().await {
                tracing::warn!(run_id = %ctx.run_id, %err, "kill after divergence failed");
            }
            (RunStatus::Failed, Some(message), None)
        }
    };

    match Run::finish_if(
        &ctx.db.pool,
        ctx.run_id,
        RunStatus::Running,
        status,
        error.as_deref(),
        artifact.as_deref(),
    )
    .await
    {
        Ok(true) => tracing::info!(run_id = %ctx.run_id, %status, "run finished"),
        Ok(false) => tracing::warn!(run_id = %ctx.run_id, "run already left running state"),
        Err(err) => tracing::error!(run_id = %ctx.run_id, %err, "failed to record run outcome"),
    }
    ctx.relay.finish(status, error, artifact);
    let _ = ctx.finished.send(true);
}

fn agent_command(
    base: &str,
    run: &Run,
    task: Option<&str>,
) -> Result<String, CoordinatorError> {
    let phase = shlex::try_quote(&run.phase)
        .map_err(|_| CoordinatorError::InvalidInput("phase contains a nul byte".to_string()))?;
    let mut command = format!("{base} --conversation {} --phase {phase}", run.conversation_id);
    match task {
        Some(task) => {
            let task = shlex::try_quote(task).map_err(|_| {
                CoordinatorError::InvalidInput("task contains a nul byte".to_string())
            })?;
            command.push_str(&format!(" --task {task}"));
        }
        None => command.push_str(" --resume"),
    }
    Ok(command)
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
