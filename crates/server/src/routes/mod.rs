use std::sync::Arc;

use axum::Router;
use db::DBService;
use services::services::{ConsistencyChecker, LifecycleService, RunCoordinator};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod health;
pub mod projects;
pub mod runs;

#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub lifecycle: Arc<LifecycleService>,
    pub coordinator: Arc<RunCoordinator>,
    pub checker: ConsistencyChecker,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(health::router())
        .merge(projects::router())
        .merge(runs::router());
    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
