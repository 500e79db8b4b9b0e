//! HTTP API of the runtime manager
//!
//! Provides REST API endpoints for:
//! - Session creation, inspection and cancellation
//! - Result slots: listing, upload, download, real-time factor
//! - The system catalog
//! - Health, version and metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
///
/// Resource routes are served both at the root, where existing clients
/// expect them, and under `/api/v1`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/version", get(handlers::health::version))
        // Prometheus metrics (no auth for scraping)
        .route("/metrics", get(crate::metrics::metrics_handler))
        .merge(api_v1_routes())
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}

/// API v1 routes
fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Sessions
        .route(
            "/sessions",
            post(handlers::sessions::create_session).get(handlers::sessions::list_sessions),
        )
        .route(
            "/sessions/:session_id",
            get(handlers::sessions::get_session).delete(handlers::sessions::cancel_session),
        )
        // Results
        .route("/sessions/:session_id/results", get(handlers::results::list_results))
        .route(
            "/sessions/:session_id/results/:slot",
            get(handlers::results::download_result).put(handlers::results::upload_result),
        )
        .route(
            "/sessions/:session_id/results/:slot/rtf",
            get(handlers::results::real_time_factor),
        )
        // System catalog
        .route(
            "/systems",
            get(handlers::systems::list_systems).post(handlers::systems::register_system),
        )
        .route("/systems/:name", get(handlers::systems::get_system_versions))
        .route("/systems/:name/:version", get(handlers::systems::get_system))
        .route(
            "/systems/:name/:version/syscfg",
            get(handlers::systems::default_configuration),
        )
        .route(
            "/systems/:name/:version/description",
            get(handlers::systems::get_system_description),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::container::fake::{FakeBehavior, FakeDriver};
    use crate::models::{CreateSessionResponse, ErrorResponse, SessionListResponse};
    use crate::session::{SessionManager, SessionRecord, SessionState};
    use crate::store::SessionRecordStore;
    use crate::sysdef::tests::sample_sysdef;
    use crate::sysdef::SystemCatalog;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde::de::DeserializeOwned;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const PERF: &[u8] = br#"{"cycles": 4000, "instructions": 3000}"#;

    async fn app(behavior: FakeBehavior) -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            systems_dir: dir.path().join("systems"),
            ..AppConfig::default()
        };
        tokio::fs::create_dir_all(&config.systems_dir).await.unwrap();

        let catalog = Arc::new(SystemCatalog::empty(&config.systems_dir));
        catalog.insert(sample_sysdef()).await.unwrap();
        let store = Arc::new(SessionRecordStore::open(&config.sessions_dir()).await.unwrap());
        let driver = Arc::new(FakeDriver::new(behavior));
        let sessions = Arc::new(SessionManager::new(&config, catalog.clone(), driver, store));

        let state = Arc::new(AppState {
            config,
            sessions,
            catalog,
        });
        (dir, create_router(state))
    }

    async fn call<T: DeserializeOwned>(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let body = body.map_or_else(Body::empty, |json| Body::from(json.to_string()));
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn create(app: &Router) -> CreateSessionResponse {
        let (status, created) = call(
            app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({ "system": { "name": "riscv-vp", "version": "1.2" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        created
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let (_dir, app) = app(FakeBehavior {
            run_time: None,
            ..FakeBehavior::default()
        })
        .await;

        let created = create(&app).await;
        assert_eq!(created.state, SessionState::Provisioning);

        let uri = format!("/api/v1/sessions/{}", created.session_id);
        let (status, record): (_, SessionRecord) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record.id, created.session_id);

        let (status, cancelled): (_, SessionRecord) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled.state, SessionState::Cancelled);

        let (status, error): (_, ErrorResponse) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error.error, "AlreadyTerminal");

        let (status, list): (_, SessionListResponse) =
            call(&app, Method::GET, "/api/v1/sessions?state=cancelled", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.total, 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_dir, app) = app(FakeBehavior::default()).await;

        let uri = format!("/api/v1/sessions/{}", uuid::Uuid::new_v4());
        let (status, error): (_, ErrorResponse) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error.error, "NotFound");

        let (status, error): (_, ErrorResponse) = call(
            &app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({
                "syscfg": {
                    "system": { "name": "riscv-vp", "version": "1.2" },
                    "run_parameters": { "clock_mhz": 5000.0 }
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "ConfigurationInvalid");

        let (status, _): (_, ErrorResponse) =
            call(&app, Method::GET, "/api/v1/systems/unknown/1.0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_and_download_result() {
        let (_dir, app) = app(FakeBehavior {
            run_time: None,
            artifacts: HashMap::new(),
            ..FakeBehavior::default()
        })
        .await;
        let created = create(&app).await;

        // wait until the container is running
        let uri = format!("/api/v1/sessions/{}", created.session_id);
        for _ in 0..50 {
            let (_, record): (_, SessionRecord) = call(&app, Method::GET, &uri, None).await;
            if record.state == SessionState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let slot_uri = format!("/api/v1/sessions/{}/results/perf", created.session_id);
        let request = Request::builder()
            .method(Method::PUT)
            .uri(&slot_uri)
            .body(Body::from(PERF))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let request = Request::builder().uri(&slot_uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], PERF);

        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/api/v1/sessions/{}/results/speed", created.session_id))
            .body(Body::from(&b"not json"[..]))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_system_catalog_routes() {
        let (_dir, app) = app(FakeBehavior::default()).await;

        let (status, syscfg): (_, crate::sysdef::SystemConfiguration) =
            call(&app, Method::GET, "/api/v1/systems/riscv-vp/1.2/syscfg", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(syscfg.system.name, "riscv-vp");

        let mut sysdef = serde_json::to_value(sample_sysdef()).unwrap();
        sysdef["version"] = serde_json::json!("1.3");
        let (status, _): (_, crate::sysdef::SystemRef) =
            call(&app, Method::POST, "/api/v1/systems", Some(sysdef.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, error): (_, ErrorResponse) =
            call(&app, Method::POST, "/api/v1/systems", Some(sysdef)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error.error, "AlreadyExists");

        let (status, entry): (_, crate::models::SystemEntry) =
            call(&app, Method::GET, "/api/v1/systems/riscv-vp", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry.versions, vec!["1.2", "1.3"]);
    }

    async fn raw(app: &Router, method: Method, uri: &str, body: &'static str) -> (StatusCode, ErrorResponse) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_session_routes_at_root() {
        let (_dir, app) = app(FakeBehavior {
            run_time: None,
            ..FakeBehavior::default()
        })
        .await;

        let (status, created): (_, CreateSessionResponse) = call(
            &app,
            Method::POST,
            "/sessions",
            Some(serde_json::json!({ "system": { "name": "riscv-vp", "version": "1.2" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let uri = format!("/sessions/{}", created.session_id);
        let (status, record): (_, SessionRecord) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record.id, created.session_id);

        // the same session is visible under the versioned prefix
        let (status, list): (_, SessionListResponse) =
            call(&app, Method::GET, "/api/v1/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.total, 1);

        let (status, cancelled): (_, SessionRecord) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled.state, SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_malformed_bodies_use_error_taxonomy() {
        let (_dir, app) = app(FakeBehavior::default()).await;

        let (status, error) = raw(&app, Method::POST, "/sessions", "{ not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "ConfigurationInvalid");

        let (status, error) = raw(&app, Method::POST, "/api/v1/sessions", r#"{"system": 42}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "ConfigurationInvalid");

        // object values are only meaningful as file references
        let (status, error) = raw(
            &app,
            Method::POST,
            "/sessions",
            r#"{"syscfg": {"system": {"name": "riscv-vp", "version": "1.2"},
                "run_parameters": {"firmware": {"path": "fw.elf"}}}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "ConfigurationInvalid");

        let (status, error) = raw(&app, Method::POST, "/systems", r#"{"name": "vp"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "DefinitionInvalid");
    }

    #[tokio::test]
    async fn test_hostile_definition_is_rejected() {
        let (dir, app) = app(FakeBehavior::default()).await;

        let mut sysdef = serde_json::to_value(sample_sysdef()).unwrap();
        sysdef["version"] = serde_json::json!("2.0");
        sysdef["results"]["/../../../escaped"] = serde_json::json!({ "type": "text", "path": "out/x.txt" });
        let (status, error): (_, ErrorResponse) =
            call(&app, Method::POST, "/systems", Some(sysdef)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error.error, "DefinitionInvalid");
        assert_eq!(std::fs::read_dir(dir.path().join("systems")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_system_description() {
        let (_dir, app) = app(FakeBehavior::default()).await;

        let mut sysdef = serde_json::to_value(sample_sysdef()).unwrap();
        sysdef["version"] = serde_json::json!("2.0");
        sysdef["documentation"] = serde_json::json!({
            "contact": "vp@example.com",
            "summary": "RISC-V VP",
            "description": "# RISC-V VP"
        });
        let (status, _): (_, crate::sysdef::SystemRef) =
            call(&app, Method::POST, "/systems", Some(sysdef)).await;
        assert_eq!(status, StatusCode::CREATED);

        let request = Request::builder()
            .uri("/systems/riscv-vp/2.0/description")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/markdown; charset=utf-8");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"# RISC-V VP");

        // documented nowhere
        let (status, _): (_, ErrorResponse) =
            call(&app, Method::GET, "/systems/riscv-vp/1.2/description", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
