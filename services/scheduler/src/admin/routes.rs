//! Admin endpoints.
//!
//! - `GET /healthz`: process liveness
//! - `GET /v1/status`: controller status plus a registry snapshot
//! - `GET /v1/members`: members of every generation still tracked
//! - `POST /v1/reseed`: force a reseed

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use seedkeeper_id::Generation;
use serde::Serialize;
use tracing::warn;

use super::{AdminState, ApiError};
use crate::launcher::LauncherState;
use crate::registry::{Member, RegistrySnapshot};
use crate::reseed::ControllerStatus;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub cluster: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cluster: String,
    pub controller: ControllerStatus,
    pub launcher: LauncherState,
    pub registry: RegistrySnapshot,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub generation: Generation,
    pub members: Vec<Member>,
}

#[derive(Debug, Serialize)]
pub struct ReseedResponse {
    pub status: &'static str,
    pub generation: Generation,
}

pub fn health() -> Router<AdminState> {
    Router::new().route("/healthz", get(healthz))
}

pub fn v1() -> Router<AdminState> {
    Router::new()
        .route("/status", get(status))
        .route("/members", get(members))
        .route("/reseed", post(reseed))
}

async fn healthz(State(state): State<AdminState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "seedkeeper-scheduler",
        version: env!("CARGO_PKG_VERSION"),
        cluster: state.cluster_name().to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn status(State(state): State<AdminState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        cluster: state.cluster_name().to_string(),
        controller: state.reseed().status(),
        launcher: state.launcher_state(),
        registry: state.registry().snapshot().await,
    })
}

async fn members(State(state): State<AdminState>) -> Json<MembersResponse> {
    let snapshot = state.registry().snapshot().await;
    Json(MembersResponse {
        generation: snapshot.generation,
        members: snapshot.members,
    })
}

async fn reseed(State(state): State<AdminState>) -> Result<impl IntoResponse, ApiError> {
    warn!(cluster = state.cluster_name(), "Reseed requested through admin API");
    state.reseed().trigger("admin request")?;
    let generation = state.registry().generation().await;
    Ok((
        StatusCode::ACCEPTED,
        Json(ReseedResponse {
            status: "accepted",
            generation,
        }),
    ))
}
