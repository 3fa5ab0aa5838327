//! HTTP router configuration.
//!
//! A single catch-all GET handler renders everything; the static front
//! door and crawler detection live outside this process.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::coordinator::render_page;
use crate::state::GatewayState;

/// Build the application router.
///
/// Every GET falls through to the render pipeline; other methods receive
/// 405 from the method router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(render_page))
        .route("/*path", get(render_page))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use crawlserver_common::GatewayConfig;
    use tower::util::ServiceExt;

    fn stub_config() -> GatewayConfig {
        let mut config = GatewayConfig::new("/nonexistent/app.wasm", 4100);
        config.child_processes = 1;
        config.worker_command = Some(vec![
            "/bin/sh".into(),
            "-c".into(),
            "while read line; do :; done".into(),
        ]);
        config
    }

    #[tokio::test]
    async fn test_blocked_extension_is_404() {
        let state = GatewayState::new(stub_config()).unwrap();
        let router = build_router(state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/favicon.ico")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.pool().shutdown();
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let state = GatewayState::new(stub_config()).unwrap();
        let router = build_router(state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        state.pool().shutdown();
    }

    #[tokio::test]
    async fn test_missing_wasm_is_500() {
        let state = GatewayState::new(stub_config()).unwrap();
        let router = build_router(state.clone());

        let response = router
            .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        state.pool().shutdown();
    }
}
