//! Divergence detection between the persisted picture of a project's sandbox
//! and what the runtime actually reports.
//!
//! Checks run only on demand, from the run supervisor's liveness poll and
//! from status queries that ask for verification. Nothing here mutates
//! state; callers decide what to do with a divergent report.

use std::sync::Arc;

use db::models::project::{Project, ProjectStatus};
use sandbox::{SandboxError, SandboxRuntime, SandboxState};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ConsistencyReport {
    Consistent,
    /// Persisted state says the sandbox is live; the runtime disagrees.
    DivergentStale { sandbox_id: String, observed: String },
    /// The runtime reports a live sandbox the persisted state does not
    /// consider live. Flagged, never removed automatically.
    DivergentPhantom { sandbox_id: String },
}

#[derive(Clone)]
pub struct ConsistencyChecker {
    runtime: Arc<dyn SandboxRuntime>,
}

impl ConsistencyChecker {
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn check_project(
        &self,
        project: &Project,
    ) -> Result<ConsistencyReport, SandboxError> {
        let expects_live = project.status == ProjectStatus::Ready;
        let report = self
            .check_sandbox(project.sandbox_id.as_deref(), expects_live)
            .await?;
        if let ConsistencyReport::DivergentPhantom { sandbox_id } = &report {
            tracing::warn!(
                project_id = %project.id,
                sandbox_id,
                "runtime reports a live sandbox the ledger does not"
            );
        }
        Ok(report)
    }

    /// Compare a persisted sandbox reference against the runtime.
    /// `expects_live` is what the persisted state claims.
    pub async fn check_sandbox(
        &self,
        persisted: Option<&str>,
        expects_live: bool,
    ) -> Result<ConsistencyReport, SandboxError> {
        let Some(sandbox_id) = persisted else {
            return Ok(ConsistencyReport::Consistent);
        };
        let observed = match self.runtime.inspect(sandbox_id).await {
            Ok(state) => state,
            Err(SandboxError::NotFound(_)) => SandboxState::Unknown("absent".to_string()),
            Err(err) => return Err(err),
        };
        let report = match (expects_live, observed.is_running()) {
            (true, false) => ConsistencyReport::DivergentStale {
                sandbox_id: sandbox_id.to_string(),
                observed: observed.to_string(),
            },
            (false, true) => ConsistencyReport::DivergentPhantom {
                sandbox_id: sandbox_id.to_string(),
            },
            _ => ConsistencyReport::Consistent,
        };
        Ok(report)
    }

    /// Liveness probe used by run supervision: the run's sandbox must be
    /// running.
    pub async fn sandbox_is_live(
        &self,
        sandbox_id: &str,
        project_id: Uuid,
    ) -> Result<bool, SandboxError> {
        match self.check_sandbox(Some(sandbox_id), true).await? {
            ConsistencyReport::Consistent => Ok(true),
            report => {
                tracing::warn!(%project_id, sandbox_id, ?report, "sandbox diverged during run");
                Ok(false)
            }
        }
    }
}
