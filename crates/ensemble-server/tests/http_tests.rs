//! Router-level tests over plain HTTP (the WS endpoint is exercised through
//! the session tests; here we check routing and health output).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use ensemble_core::{CreditLimits, CreditTracker, EngineConfig, Result};
use ensemble_server::{router, AppState, SessionBackend, SessionRuntime};

struct UnusedBackend;

#[async_trait]
impl SessionBackend for UnusedBackend {
    async fn start(&self, _workspace_path: &Path) -> Result<SessionRuntime> {
        Err(ensemble_core::EnsembleError::InvalidOperation(
            "not wired in this test".to_string(),
        ))
    }
}

fn state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let credit = Arc::new(CreditTracker::with_usage_file(
        CreditLimits::default(),
        dir.path().join("usage.json"),
    ));
    (
        AppState {
            config: EngineConfig::default(),
            credit,
            backend: Arc::new(UnusedBackend),
        },
        dir,
    )
}

#[tokio::test]
async fn healthz_reports_ok_and_version() {
    let (state, _dir) = state();
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (state, _dir) = state();
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
