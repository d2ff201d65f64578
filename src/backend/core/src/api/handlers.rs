//! Admin request handlers with proper error propagation.
//!
//! Handlers return `Result<impl IntoResponse, CaravelError>`; errors map
//! to HTTP status codes through the `IntoResponse` implementation on
//! `CaravelError`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiResponse, AppState};
use crate::error::CaravelError;
use crate::protocol::{CommandInfo, TaskState};
use crate::task::{ApplicationSpec, TaskSpec};

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "tasks": state.registry.total_tasks(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deploy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct DeployResponse {
    pub name: String,
    pub task_id: String,
}

pub async fn deploy(
    State(state): State<AppState>,
    Json(payload): Json<ApplicationSpec>,
) -> Result<impl IntoResponse, CaravelError> {
    let spec = admit_with_executor(payload, &state)?;
    let response = DeployResponse {
        name: spec.name.clone(),
        task_id: spec.task_id.clone(),
    };

    state.registry.add(spec).await?;
    request_offers(&state).await;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message("Task deployed", response)),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Kill
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct KillRequest {
    pub name: String,
}

pub async fn kill(
    State(state): State<AppState>,
    Json(request): Json<KillRequest>,
) -> Result<impl IntoResponse, CaravelError> {
    let spec = state.registry.get_by_name(&request.name)?;
    state.retry.cancel(&spec.task_id);

    // A task that never launched has nothing to kill at the master.
    if state.registry.state_of(&request.name) == Some(TaskState::Unknown) {
        state.registry.delete(&spec).await?;
        info!(name = %request.name, "Queued task removed");
        return Ok(Json(ApiResponse::success_with_message(
            "Queued task removed",
            serde_json::json!({ "name": request.name }),
        )));
    }

    state
        .driver
        .kill(spec.task_id.clone(), spec.agent_id.clone())
        .await?;
    state.registry.set(TaskState::Killing, spec).await?;
    info!(name = %request.name, "Kill issued");

    Ok(Json(ApiResponse::success_with_message(
        "Kill issued",
        serde_json::json!({ "name": request.name }),
    )))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Update
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn update(
    State(state): State<AppState>,
    Json(payload): Json<ApplicationSpec>,
) -> Result<impl IntoResponse, CaravelError> {
    let old = state.registry.get_by_name(&payload.name)?;
    state.retry.cancel(&old.task_id);

    // Replace means: stop the running instance, re-admit the new spec
    // under a fresh task id, and let the next offers turn relaunch it.
    if state.registry.state_of(&payload.name) != Some(TaskState::Unknown) {
        if let Err(e) = state
            .driver
            .kill(old.task_id.clone(), old.agent_id.clone())
            .await
        {
            warn!(name = %old.name, error = %e, "Kill of replaced task failed");
        }
    }
    state.registry.delete(&old).await?;

    let spec = admit_with_executor(payload, &state)?;
    let response = DeployResponse {
        name: spec.name.clone(),
        task_id: spec.task_id.clone(),
    };
    state.registry.add(spec).await?;
    request_offers(&state).await;

    Ok(Json(ApiResponse::success_with_message(
        "Task updated",
        response,
    )))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status / Catalog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub task_id: String,
    pub state: TaskState,
}

pub async fn status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, CaravelError> {
    let spec = state.registry.get_by_name(&name)?;
    let task_state = state
        .registry
        .state_of(&name)
        .unwrap_or(TaskState::Unknown);

    Ok(Json(ApiResponse::success(TaskSummary {
        name,
        task_id: spec.task_id,
        state: task_state,
    })))
}

pub async fn all_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let tasks: Vec<TaskSummary> = state
        .registry
        .tasks()
        .into_iter()
        .map(|record| TaskSummary {
            name: record.spec.name,
            task_id: record.spec.task_id,
            state: record.state,
        })
        .collect();
    Json(ApiResponse::success(tasks))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate and admit a payload, wiring the executor fetch URI for tasks
/// that launch through the custom executor.
fn admit_with_executor(
    payload: ApplicationSpec,
    state: &AppState,
) -> Result<TaskSpec, CaravelError> {
    let mut spec = payload.admit(&state.config.framework.user)?;

    if let Some(executor) = spec.executor.as_mut() {
        let fetch_uri = format!(
            "http://{}:{}/{}",
            state.config.framework.hostname,
            state.config.executor.port,
            state.config.executor.path,
        );
        let command = executor.command.get_or_insert_with(|| CommandInfo {
            value: format!("./{}", state.config.executor.path),
            ..Default::default()
        });
        if command.uris.is_empty() {
            command.uris.push(fetch_uri);
        }
    }

    Ok(spec)
}

/// Nudge the master for offers after admission. Throttled or failing
/// revives are fine; the next offers turn picks the task up anyway.
async fn request_offers(state: &AppState) {
    match state.driver.revive().await {
        Ok(true) => {}
        Ok(false) => warn!("Revive throttled after admission"),
        Err(e) => warn!(error = %e, "Revive failed after admission"),
    }
}
