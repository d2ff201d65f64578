//! Admin API for the scheduler.
//!
//! A small JSON surface for operators: deploy, kill, update, status, and
//! a catalog listing, plus unversioned health and metrics endpoints.
//! Handlers call into the registry and driver with the same contracts the
//! event loop uses; per-name serialization inside the registry keeps
//! admin writes off tasks the loop is mutating.

mod handlers;

use axum::{
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::driver::SchedulerDriver;
use crate::task::{RetryController, TaskRegistry};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub driver: Arc<SchedulerDriver>,
    pub retry: Arc<RetryController>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

/// Envelope wrapping every admin response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: None,
            data: Some(data),
        }
    }

    pub fn success_with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

/// Build the admin router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/v1/deploy", post(handlers::deploy))
        .route("/v1/kill", post(handlers::kill))
        .route("/v1/update", put(handlers::update))
        .route("/v1/status/:name", get(handlers::status))
        .route("/v1/tasks", get(handlers::all_tasks))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
