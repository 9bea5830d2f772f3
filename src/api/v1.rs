use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::{api::loadpoint, auth, core::AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/loadpoints", get(loadpoint::list_loadpoints))
        .route("/loadpoints/:name", get(loadpoint::get_loadpoint))
        .route(
            "/loadpoints/:name/mode",
            get(loadpoint::get_mode).post(loadpoint::set_mode),
        )
        .route("/loadpoints/:name/targetsoc", post(loadpoint::set_target_soc))
        .route("/loadpoints/:name/minsoc", post(loadpoint::set_min_soc))
        .route(
            "/loadpoints/:name/phases",
            get(loadpoint::get_phases).post(loadpoint::set_phases),
        )
        .route(
            "/loadpoints/:name/targetcharge",
            post(loadpoint::set_target_charge),
        )
        .route(
            "/loadpoints/:name/mincurrent",
            post(loadpoint::set_min_current),
        )
        .route(
            "/loadpoints/:name/maxcurrent",
            post(loadpoint::set_max_current),
        )
        .route(
            "/loadpoints/:name/remotedemand",
            post(loadpoint::set_remote_demand),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.site.status_snapshot())
}
