use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    api::error::ApiError,
    core::{AppState, Loadpoint, LoadpointStatus},
    domain::{ChargeMode, RemoteDemand},
};

fn resolve(state: &AppState, name: &str) -> Result<Arc<Loadpoint>, ApiError> {
    state
        .site
        .loadpoint_by_name(name)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("loadpoint {name}")))
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

fn ack() -> Json<AckResponse> {
    Json(AckResponse { success: true })
}

pub async fn list_loadpoints(State(state): State<AppState>) -> Json<Vec<LoadpointStatus>> {
    Json(
        state
            .site
            .loadpoints()
            .iter()
            .map(|lp| lp.status_snapshot())
            .collect(),
    )
}

pub async fn get_loadpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LoadpointStatus>, ApiError> {
    Ok(Json(resolve(&state, &name)?.status_snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: ChargeMode,
}

pub async fn get_mode(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ChargeMode>, ApiError> {
    Ok(Json(resolve(&state, &name)?.mode()))
}

pub async fn set_mode(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetModeRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_mode(req.mode);
    Ok(ack())
}

#[derive(Debug, Deserialize)]
pub struct SocRequest {
    pub soc: u8,
}

pub async fn set_target_soc(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SocRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_target_soc(req.soc)?;
    Ok(ack())
}

pub async fn set_min_soc(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SocRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_min_soc(req.soc)?;
    Ok(ack())
}

#[derive(Debug, Deserialize)]
pub struct PhasesRequest {
    pub phases: u8,
}

pub async fn get_phases(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<u8>, ApiError> {
    Ok(Json(resolve(&state, &name)?.phases()))
}

pub async fn set_phases(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<PhasesRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_phases(req.phases)?;
    Ok(ack())
}

#[derive(Debug, Deserialize)]
pub struct TargetChargeRequest {
    pub time: DateTime<Utc>,
    pub soc: u8,
}

pub async fn set_target_charge(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<TargetChargeRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_target_charge(req.time, req.soc)?;
    Ok(ack())
}

#[derive(Debug, Deserialize)]
pub struct CurrentRequest {
    pub current_a: f64,
}

pub async fn set_min_current(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CurrentRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_min_current_a(req.current_a)?;
    Ok(ack())
}

pub async fn set_max_current(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CurrentRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.set_max_current_a(req.current_a)?;
    Ok(ack())
}

#[derive(Debug, Deserialize)]
pub struct RemoteDemandRequest {
    pub source: String,
    pub demand: RemoteDemand,
}

pub async fn set_remote_demand(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RemoteDemandRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    resolve(&state, &name)?.remote_control(&req.source, req.demand);
    Ok(ack())
}
