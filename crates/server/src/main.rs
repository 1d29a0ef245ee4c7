use std::{env, sync::Arc};

use db::DBService;
use sandbox::{DockerRuntime, SandboxConfig, SandboxRuntime};
use services::services::{
    ConsistencyChecker, LifecycleService, OrchestratorConfig, ProjectLocks, RunCoordinator,
};
use tracing_subscriber::EnvFilter;

mod error;
mod response;
mod routes;

use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db = DBService::new().await?;
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(DockerRuntime::new().await?);
    let sandbox_config = SandboxConfig::from_env();
    let orchestrator_config = OrchestratorConfig::from_env();
    let locks = ProjectLocks::new();

    let lifecycle = Arc::new(LifecycleService::new(
        db.clone(),
        runtime.clone(),
        sandbox_config,
        orchestrator_config.provision_timeout,
        locks.clone(),
    ));
    let coordinator = Arc::new(RunCoordinator::new(
        db.clone(),
        runtime.clone(),
        orchestrator_config,
        locks,
    ));
    // Runs left over from a previous process can never complete.
    coordinator.cleanup_orphan_runs().await?;
    let checker = ConsistencyChecker::new(runtime);

    let app = routes::router(AppState {
        db,
        lifecycle,
        coordinator,
        checker,
    });

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
