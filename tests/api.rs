//! Control-surface tests driven through the axum router.

#![cfg(feature = "sim")]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use open_charge_controller::api;
use open_charge_controller::config::{
    AuthConfig, ChargerConfig, Config, ControllerConfig, DeviceKind, LoadpointConfig,
    ServerConfig, SiteConfig,
};
use open_charge_controller::core::AppState;
use open_charge_controller::domain::ChargeMode;

const TOKEN: &str = "testtoken";

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            enable_cors: false,
            request_timeout_secs: 5,
        },
        auth: AuthConfig {
            token: TOKEN.into(),
        },
        controller: ControllerConfig {
            interval_secs: 10,
            io_timeout_ms: 200,
            fail_threshold: 3,
            pv_debounce_secs: 60,
            phase_dwell_secs: 300,
        },
        site: SiteConfig {
            title: "test".into(),
            residual_power_w: 0.0,
            voltage_v: 230.0,
            grid_meter: None,
            pv_meter: None,
            battery_meter: None,
        },
        loadpoints: vec![LoadpointConfig {
            name: "garage".into(),
            charger: ChargerConfig {
                kind: DeviceKind::Sim,
                min_current_a: 6.0,
                max_current_a: 32.0,
                phases: 3,
                phase_switching: false,
            },
            charge_meter: None,
            vehicle: None,
            mode: ChargeMode::Pv,
            min_current_a: 6.0,
            max_current_a: 16.0,
            phases: 3,
            min_soc: None,
            target_soc: None,
        }],
    }
}

fn test_router() -> (axum::Router, AppState) {
    let cfg = test_config();
    let state = AppState::new(cfg.clone()).unwrap();
    (api::router(state.clone(), &cfg), state)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, json: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_owned()))
        .unwrap()
}

async fn body_string(res: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(res.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn healthz_needs_no_token() {
    let (router, _) = test_router();
    let res = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_rejects_missing_or_wrong_token() {
    let (router, _) = test_router();
    let res = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/status")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mode_round_trips_through_the_api() {
    let (router, state) = test_router();

    let res = router
        .clone()
        .oneshot(get("/api/v1/loadpoints/garage/mode"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_string(res).await, "\"pv\"");

    let res = router
        .clone()
        .oneshot(post("/api/v1/loadpoints/garage/mode", r#"{"mode":"now"}"#))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(state.site.loadpoint(0).unwrap().mode(), ChargeMode::Now);
}

#[tokio::test]
async fn invalid_writes_are_rejected_with_an_explanation() {
    let (router, _) = test_router();

    let res = router
        .clone()
        .oneshot(post("/api/v1/loadpoints/garage/targetsoc", r#"{"soc":150}"#))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(res).await.contains("150"));

    // this charger cannot switch phases
    let res = router
        .clone()
        .oneshot(post("/api/v1/loadpoints/garage/phases", r#"{"phases":1}"#))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED);

    let res = router
        .oneshot(post(
            "/api/v1/loadpoints/garage/maxcurrent",
            r#"{"current_a":64.0}"#,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_loadpoint_is_not_found() {
    let (router, _) = test_router();
    let res = router
        .oneshot(get("/api/v1/loadpoints/carport/mode"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remote_demand_is_applied_through_the_api() {
    let (router, state) = test_router();
    let res = router
        .oneshot(post(
            "/api/v1/loadpoints/garage/remotedemand",
            r#"{"source":"relay.example","demand":"hard"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let remote = state.site.loadpoint(0).unwrap().remote_override().unwrap();
    assert_eq!(remote.source, "relay.example");
}
