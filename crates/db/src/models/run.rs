use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Done,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Stopped)
    }

    /// Stopped and failed runs may be resumed; done runs may not.
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Done => write!(f, "done"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One execution attempt of the agent inside a project's sandbox.
/// Rows are never deleted; they form the audit trail of every attempt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub iteration: i64,
    pub phase: String,
    pub status: RunStatus,
    /// Correlation id allowing a resumed run to continue the agent's
    /// prior conversation context.
    pub conversation_id: Uuid,
    pub error_message: Option<String>,
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateRun {
    pub project_id: Uuid,
    pub phase: String,
    pub conversation_id: Uuid,
}

const SELECT_COLUMNS: &str = r#"id, project_id, iteration, phase, status, conversation_id,
    error_message, artifact_path, created_at, started_at, finished_at"#;

impl Run {
    /// Create a new run in `created` status. The iteration index is
    /// allocated atomically as max(iteration)+1 per project; callers must
    /// hold the per-project exclusion while deciding to create at all.
    pub async fn create(pool: &SqlitePool, data: &CreateRun, id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO runs (id, project_id, iteration, phase, status, conversation_id, created_at)
               VALUES (
                   $1, $2,
                   (SELECT COALESCE(MAX(iteration) + 1, 0) FROM runs WHERE project_id = $2),
                   $3, $4, $5, $6
               )"#,
        )
        .bind(id)
        .bind(data.project_id)
        .bind(&data.phase)
        .bind(RunStatus::Created)
        .bind(data.conversation_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {SELECT_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {SELECT_COLUMNS} FROM runs WHERE project_id = $1 ORDER BY iteration ASC"
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// The unique running run for a project, if any.
    pub async fn find_running(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {SELECT_COLUMNS} FROM runs WHERE project_id = $1 AND status = 'running'"
        ))
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    /// A run that is still in flight (launch pending or running).
    pub async fn find_active(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {SELECT_COLUMNS} FROM runs
             WHERE project_id = $1 AND status IN ('created', 'running')
             LIMIT 1"
        ))
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    /// The "current" run for a project: the unique running run if one
    /// exists, otherwise the highest iteration, ties broken by latest
    /// created_at.
    pub async fn current_for_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Run>(&format!(
            "SELECT {SELECT_COLUMNS} FROM runs
             WHERE project_id = $1
             ORDER BY (status = 'running') DESC, iteration DESC, created_at DESC
             LIMIT 1"
        ))
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    /// Compare-and-swap `created -> running`. Returns whether this caller
    /// won the transition.
    pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE runs SET status = 'running', started_at = $1
               WHERE id = $2 AND status = 'created'"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-swap into a terminal status. The update applies only if
    /// the row is still in `expected`, so racing completion and stop
    /// requests cannot both win.
    pub async fn finish_if(
        pool: &SqlitePool,
        id: Uuid,
        expected: RunStatus,
        status: RunStatus,
        error_message: Option<&str>,
        artifact_path: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE runs
               SET status = $1, error_message = $2, artifact_path = $3, finished_at = $4
               WHERE id = $5 AND status = $6"#,
        )
        .bind(status)
        .bind(error_message)
        .bind(artifact_path)
        .bind(Utc::now())
        .bind(id)
        .bind(expected)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every non-terminal run as failed. Called at startup to recover
    /// runs orphaned by a previous process.
    pub async fn fail_all_active(pool: &SqlitePool, reason: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE runs
               SET status = 'failed', error_message = $1, finished_at = $2
               WHERE status IN ('created', 'running')"#,
        )
        .bind(reason)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
