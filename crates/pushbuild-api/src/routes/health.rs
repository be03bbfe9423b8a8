//! Health check endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once something is listening for notifications.
async fn ready(State(state): State<AppState>) -> Json<Value> {
    let subscribers = state.bus.subscriber_count();
    let status = if subscribers > 0 { "ready" } else { "starting" };
    Json(json!({ "status": status, "subscribers": subscribers }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use pushbuild_sync::{BroadcastBus, NotificationBus};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = crate::routes::router(AppState::new(BroadcastBus::default(), None));
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_reports_subscribers() {
        let bus = BroadcastBus::default();
        let app = crate::routes::router(AppState::new(bus.clone(), None));

        let (_, body) = get_json(app.clone(), "/health/ready").await;
        assert_eq!(body["status"], "starting");
        assert_eq!(body["subscribers"], 0);

        let _subscription = bus.subscribe("change.#").await.unwrap();
        let (status, body) = get_json(app, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["subscribers"], 1);
    }
}
