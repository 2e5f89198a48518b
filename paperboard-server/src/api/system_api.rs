use crate::auth::middleware::require_admin;
use crate::error::AppResult;
use crate::models::User;
use crate::services::render_worker::WorkerHealth;
use crate::AppState;
use axum::{extract::State, Extension, Json};
use serde::Serialize;

pub async fn render_worker_health(State(state): State<AppState>) -> Json<WorkerHealth> {
    Json(state.render_worker.health())
}

#[derive(Serialize)]
pub struct LifecycleResponse {
    /// False when the worker was already in the requested state.
    pub changed: bool,
    pub health: WorkerHealth,
}

pub async fn start_render_worker(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<LifecycleResponse>> {
    require_admin(&user)?;

    let changed = state.render_worker.start().await;
    tracing::info!("Render worker start requested by {}", user.username);
    Ok(Json(LifecycleResponse {
        changed,
        health: state.render_worker.health(),
    }))
}

pub async fn stop_render_worker(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> AppResult<Json<LifecycleResponse>> {
    require_admin(&user)?;

    let changed = state.render_worker.stop().await;
    tracing::info!("Render worker stop requested by {}", user.username);
    Ok(Json(LifecycleResponse {
        changed,
        health: state.render_worker.health(),
    }))
}
