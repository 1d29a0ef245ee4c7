use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

/// Lifecycle status of a project's sandbox binding.
///
/// `Failed` is not terminal: a new provision attempt re-enters
/// `Provisioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Type, Serialize, Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Unprovisioned,
    Provisioning,
    Ready,
    Failed,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Unprovisioned => write!(f, "unprovisioned"),
            ProjectStatus::Provisioning => write!(f, "provisioning"),
            ProjectStatus::Ready => write!(f, "ready"),
            ProjectStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    /// Runtime-assigned sandbox reference. Liveness must always be
    /// re-queried from the runtime, never trusted from this field alone.
    pub sandbox_id: Option<String>,
    pub status: ProjectStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub repo_url: String,
    pub branch: Option<String>,
}

impl Project {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        let branch = data.branch.clone().unwrap_or_else(|| "main".to_string());
        sqlx::query(
            r#"INSERT INTO projects (id, name, repo_url, branch, status, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.repo_url)
        .bind(&branch)
        .bind(ProjectStatus::Unprovisioned)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, name, repo_url, branch, sandbox_id, status, last_error,
                      created_at, updated_at
               FROM projects WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, name, repo_url, branch, sandbox_id, status, last_error,
                      created_at, updated_at
               FROM projects ORDER BY created_at DESC"#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(r#"UPDATE projects SET status = $1, updated_at = $2 WHERE id = $3"#)
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Update status together with the recorded error. Passing `None`
    /// clears a previous error.
    pub async fn update_status_with_error(
        pool: &SqlitePool,
        id: Uuid,
        status: ProjectStatus,
        last_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE projects SET status = $1, last_error = $2, updated_at = $3 WHERE id = $4"#,
        )
        .bind(status)
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_sandbox(
        pool: &SqlitePool,
        id: Uuid,
        sandbox_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(r#"UPDATE projects SET sandbox_id = $1, updated_at = $2 WHERE id = $3"#)
            .bind(sandbox_id)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn clear_sandbox(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(r#"UPDATE projects SET sandbox_id = NULL, updated_at = $1 WHERE id = $2"#)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(r#"DELETE FROM projects WHERE id = $1"#)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn sample() -> CreateProject {
        CreateProject {
            name: "demo".to_string(),
            repo_url: "https://example.com/demo.git".to_string(),
            branch: None,
        }
    }

    #[tokio::test]
    async fn create_defaults_to_unprovisioned_and_main_branch() {
        let db = DBService::in_memory().await.unwrap();
        let project = Project::create(&db.pool, &sample(), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(project.status, ProjectStatus::Unprovisioned);
        assert_eq!(project.branch, "main");
        assert!(project.sandbox_id.is_none());
        assert!(project.last_error.is_none());
    }

    #[tokio::test]
    async fn status_and_sandbox_roundtrip() {
        let db = DBService::in_memory().await.unwrap();
        let project = Project::create(&db.pool, &sample(), Uuid::new_v4())
            .await
            .unwrap();

        Project::update_status(&db.pool, project.id, ProjectStatus::Provisioning)
            .await
            .unwrap();
        Project::set_sandbox(&db.pool, project.id, "sbx-1")
            .await
            .unwrap();
        Project::update_status(&db.pool, project.id, ProjectStatus::Ready)
            .await
            .unwrap();

        let fetched = Project::find_by_id(&db.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ProjectStatus::Ready);
        assert_eq!(fetched.sandbox_id.as_deref(), Some("sbx-1"));

        Project::update_status_with_error(
            &db.pool,
            project.id,
            ProjectStatus::Failed,
            Some("create failed"),
        )
        .await
        .unwrap();
        Project::clear_sandbox(&db.pool, project.id).await.unwrap();

        let fetched = Project::find_by_id(&db.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ProjectStatus::Failed);
        assert_eq!(fetched.last_error.as_deref(), Some("create failed"));
        assert!(fetched.sandbox_id.is_none());
    }
}
