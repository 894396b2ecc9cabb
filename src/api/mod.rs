pub mod error;
mod handlers;

pub use handlers::{LaunchResponse, PingResponse, StatusResponse};

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::registry::EmulatorRegistry;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: EmulatorRegistry,
    /// Value the `authorization` header of a launch request must carry.
    pub launch_secret: Arc<str>,
}

impl AppState {
    pub fn new(registry: EmulatorRegistry, launch_secret: impl Into<Arc<str>>) -> Self {
        Self {
            registry,
            launch_secret: launch_secret.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let qemu_routes = Router::new()
        .route("/launch", post(launch))
        .route("/{id}/ping", post(ping))
        .route("/{id}/kill", post(kill))
        .route("/{id}/ws/phone", get(ws_phone))
        .route("/{id}/ws/vnc", get(ws_vnc))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("x-requested-with"),
                    HeaderName::from_static("x-csrftoken"),
                    header::CONTENT_TYPE,
                ]),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/qemu", qemu_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PortAllocator;
    use crate::config::{BootTiming, EmulatorSettings};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // for oneshot()

    const SECRET: &str = "launch-secret";

    fn create_test_state(limit: usize) -> AppState {
        let settings = Arc::new(EmulatorSettings {
            qemu_bin: "/nonexistent/qemu".into(),
            qemu_dir: std::env::temp_dir(),
            image_root: "/nonexistent/images".into(),
            pkjs_bin: "/nonexistent/pkjs".into(),
            block_private_addresses: false,
            timing: BootTiming::default(),
        });
        AppState::new(
            EmulatorRegistry::new(limit, PortAllocator::new(), settings),
            SECRET,
        )
    }

    fn launch_request(secret: Option<&str>, form: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/qemu/launch")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(secret) = secret {
            builder = builder.header("authorization", secret);
        }
        builder.body(Body::from(form.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["emulators"], 0);
    }

    #[tokio::test]
    async fn test_launch_without_secret_is_forbidden() {
        let app = router(create_test_state(4));
        let form = "token=abc&platform=aplite&version=v1";
        let response = app.clone().oneshot(launch_request(None, form)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.oneshot(launch_request(Some("wrong"), form)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"]["code"], "auth_invalid");
    }

    #[tokio::test]
    async fn test_launch_at_capacity_is_unavailable() {
        let state = create_test_state(0);
        let app = router(state.clone());
        let response = app
            .oneshot(launch_request(Some(SECRET), "token=abc&platform=aplite&version=v1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_launch_rejects_path_separators() {
        let state = create_test_state(4);
        let app = router(state.clone());
        for form in [
            "token=abc&platform=..%2Fx&version=v1",
            "token=abc&platform=aplite&version=..%2F..",
        ] {
            let response = app.clone().oneshot(launch_request(Some(SECRET), form)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "form: {form}");
        }
        assert!(state.registry.is_empty());
        assert_eq!(state.registry.allocator().claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_rejects_missing_and_malformed_fields() {
        let app = router(create_test_state(4));
        for form in [
            "platform=aplite&version=v1",
            "token=abc&version=v1",
            "token=abc&platform=aplite",
            "token=abc&platform=aplite&version=v1&tz_offset=east",
            "token=abc&platform=spalding&version=v1",
        ] {
            let response = app.clone().oneshot(launch_request(Some(SECRET), form)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "form: {form}");
        }
    }

    #[tokio::test]
    async fn test_launch_failure_is_internal_error() {
        let state = create_test_state(4);
        let app = router(state.clone());
        let response = app
            .oneshot(launch_request(
                Some(SECRET),
                "token=abcdefghij&platform=basalt&version=v1&tz_offset=-60",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"]["code"], "launch_failed");
        assert!(state.registry.is_empty());
        assert_eq!(state.registry.allocator().claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_malformed_id_is_not_found() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/qemu/not-a-uuid/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ping_unknown_id_is_not_alive() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/qemu/{}/ping", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["alive"], false);
    }

    #[tokio::test]
    async fn test_kill_unknown_id_is_ok() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/qemu/{}/kill", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_kill_malformed_id_is_not_found() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/qemu/1234/kill")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_without_upgrade_is_bad_request() {
        let app = router(create_test_state(4));
        for channel in ["phone", "vnc"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/qemu/{}/ws/{channel}", uuid::Uuid::new_v4()))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json_body(response).await["error"]["code"], "not_websocket");
        }
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_csrf_header() {
        let app = router(create_test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/qemu/launch")
                    .header(header::ORIGIN, "https://ide.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-csrftoken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let allowed = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(allowed.contains("x-csrftoken"));
    }
}
