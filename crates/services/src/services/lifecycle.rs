//! Sandbox lifecycle: provisioning a project's sandbox and tearing it down.
//!
//! Provisioning is all-or-nothing. Any failure mid-way rolls the partial
//! sandbox back and lands the project in `Failed` with the cause recorded;
//! the project never ends up `Ready` pointing at a sandbox that was not
//! verified running.

use std::{sync::Arc, time::Duration};

use db::{DBService, models::project::{Project, ProjectStatus}};
use db::models::run::Run;
use sandbox::{ExecRequest, SandboxConfig, SandboxError, SandboxRuntime, SandboxSpec};
use thiserror::Error;
use uuid::Uuid;

use crate::services::locks::ProjectLocks;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Cannot {operation} while project is {status}")]
    InvalidTransition {
        operation: &'static str,
        status: ProjectStatus,
    },
    #[error("Project has an active run")]
    RunActive,
    #[error("Provisioning timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid repository reference: {0}")]
    InvalidRepo(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct LifecycleService {
    db: DBService,
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    provision_timeout: Duration,
    locks: ProjectLocks,
}

impl LifecycleService {
    pub fn new(
        db: DBService,
        runtime: Arc<dyn SandboxRuntime>,
        config: SandboxConfig,
        provision_timeout: Duration,
        locks: ProjectLocks,
    ) -> Self {
        Self {
            db,
            runtime,
            config,
            provision_timeout,
            locks,
        }
    }

    /// Provision a sandbox for the project: create, start, clone the
    /// repository into the workspace, then verify the sandbox is actually
    /// running before marking the project `Ready`.
    pub async fn provision(&self, project_id: Uuid) -> Result<Project, LifecycleError> {
        let lock = self.locks.get(project_id);
        let _guard = lock.lock().await;

        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(LifecycleError::ProjectNotFound)?;
        if matches!(
            project.status,
            ProjectStatus::Provisioning | ProjectStatus::Ready
        ) {
            return Err(LifecycleError::InvalidTransition {
                operation: "provision",
                status: project.status,
            });
        }

        Project::update_status_with_error(
            &self.db.pool,
            project_id,
            ProjectStatus::Provisioning,
            None,
        )
        .await?;

        let attempt =
            tokio::time::timeout(self.provision_timeout, self.provision_inner(&project)).await;
        match attempt {
            Ok(Ok(sandbox_id)) => {
                Project::set_sandbox(&self.db.pool, project_id, &sandbox_id).await?;
                Project::update_status(&self.db.pool, project_id, ProjectStatus::Ready).await?;
                tracing::info!(%project_id, sandbox_id, "project provisioned");
                Project::find_by_id(&self.db.pool, project_id)
                    .await?
                    .ok_or(LifecycleError::ProjectNotFound)
            }
            Ok(Err(err)) => {
                self.rollback(project_id, &err.to_string()).await?;
                Err(err)
            }
            Err(_) => {
                let err = LifecycleError::Timeout(self.provision_timeout);
                self.rollback(project_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn provision_inner(&self, project: &Project) -> Result<String, LifecycleError> {
        let project_key = project.id.to_string();
        let spec = SandboxSpec {
            name: self.config.container_name(&project_key),
            image: self.config.base_image.clone(),
            workspace_dir: self.config.workspace_dir(&project_key),
            memory_limit: Some(self.config.memory_limit.clone()),
            cpu_limit: Some(self.config.cpu_limit),
            network: self.config.network.clone(),
            env: Vec::new(),
        };
        let sandbox_id = self.runtime.create(&spec).await?;
        self.runtime.start(&sandbox_id).await?;

        let clone = self.clone_command(project)?;
        let output = self
            .runtime
            .exec_collect(&sandbox_id, &ExecRequest::shell(clone).in_dir("/workspace"))
            .await?;
        if !output.success() {
            return Err(LifecycleError::Sandbox(SandboxError::CommandFailed(
                format!("git clone failed: {}", output.stderr.trim()),
            )));
        }

        // A successful call sequence is not proof of liveness.
        let state = self.runtime.inspect(&sandbox_id).await?;
        if !state.is_running() {
            return Err(LifecycleError::Sandbox(SandboxError::NotRunning(
                sandbox_id,
            )));
        }
        Ok(sandbox_id)
    }

    fn clone_command(&self, project: &Project) -> Result<String, LifecycleError> {
        let url = shlex::try_quote(&project.repo_url)
            .map_err(|_| LifecycleError::InvalidRepo(project.repo_url.clone()))?;
        let branch = shlex::try_quote(&project.branch)
            .map_err(|_| LifecycleError::InvalidRepo(project.branch.clone()))?;
        Ok(format!(
            "git clone --depth {} --branch {} {} repo",
            self.config.git_depth, branch, url
        ))
    }

    async fn rollback(&self, project_id: Uuid, reason: &str) -> Result<(), LifecycleError> {
        // Container names are deterministic, so the partial sandbox can be
        // removed even if the create call never returned.
        let name = self.config.container_name(&project_id.to_string());
        if let Err(err) = self.runtime.remove(&name).await {
            tracing::warn!(%project_id, %err, "failed to remove partial sandbox");
        }
        Project::clear_sandbox(&self.db.pool, project_id).await?;
        Project::update_status_with_error(
            &self.db.pool,
            project_id,
            ProjectStatus::Failed,
            Some(reason),
        )
        .await?;
        tracing::error!(%project_id, reason, "provision failed");
        Ok(())
    }

    /// Release the project's sandbox. Refused while a run is in flight;
    /// otherwise best-effort, ending in `Unprovisioned` regardless of what
    /// the runtime says.
    pub async fn teardown(&self, project_id: Uuid) -> Result<Project, LifecycleError> {
        let lock = self.locks.get(project_id);
        let _guard = lock.lock().await;

        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(LifecycleError::ProjectNotFound)?;
        if Run::find_active(&self.db.pool, project_id).await?.is_some() {
            return Err(LifecycleError::RunActive);
        }

        if let Some(sandbox_id) = &project.sandbox_id {
            if let Err(err) = self.runtime.stop(sandbox_id, 5).await {
                tracing::warn!(%project_id, sandbox_id, %err, "sandbox stop failed");
            }
            if let Err(err) = self.runtime.remove(sandbox_id).await {
                tracing::warn!(%project_id, sandbox_id, %err, "sandbox remove failed");
            }
        }
        Project::clear_sandbox(&self.db.pool, project_id).await?;
        Project::update_status_with_error(
            &self.db.pool,
            project_id,
            ProjectStatus::Unprovisioned,
            None,
        )
        .await?;
        Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(LifecycleError::ProjectNotFound)
    }

    /// Delete the project record and its sandbox. Run history goes with it.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<(), LifecycleError> {
        let lock = self.locks.get(project_id);
        let _guard = lock.lock().await;

        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(LifecycleError::ProjectNotFound)?;
        if Run::find_active(&self.db.pool, project_id).await?.is_some() {
            return Err(LifecycleError::RunActive);
        }
        if let Some(sandbox_id) = &project.sandbox_id {
            if let Err(err) = self.runtime.remove(sandbox_id).await {
                tracing::warn!(%project_id, sandbox_id, %err, "sandbox remove failed");
            }
        }
        if !Project::delete(&self.db.pool, project_id).await? {
            return Err(LifecycleError::ProjectNotFound);
        }
        Ok(())
    }
}
