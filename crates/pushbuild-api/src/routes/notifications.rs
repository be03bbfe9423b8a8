//! Notification ingestion endpoint.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "x-pushbuild-signature";

pub fn router() -> Router<AppState> {
    Router::new().route("/{topic}", post(publish))
}

/// Publish a notification body, unchanged, on `topic`.
async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!(topic = %topic, "Invalid notification signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let delivered = state.bus.publish(topic.clone(), payload);
    debug!(topic = %topic, delivered, "Published notification");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "topic": topic, "delivered": delivered })),
    ))
}

/// Check a `sha256=<hex>` HMAC-SHA256 signature of `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pushbuild_sync::{BroadcastBus, NotificationBus, Subscription};
    use std::time::Duration;
    use tower::ServiceExt;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn post(uri: &str, body: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_vec())).unwrap()
    }

    fn change() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "payload": {
                "change": {
                    "branch": "try",
                    "rev": "abc123",
                    "revlink": "https://hg.example.org/try/rev/abc123"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_verify_signature() {
        let body = b"{}";
        let signature = sign("secret", body);
        assert!(verify_signature("secret", body, Some(&signature)));
        assert!(!verify_signature("other", body, Some(&signature)));
        assert!(!verify_signature("secret", b"{ }", Some(&signature)));
        assert!(!verify_signature("secret", body, None));
        assert!(!verify_signature("secret", body, Some("sha1=abc")));
        assert!(!verify_signature("secret", body, Some("sha256=zz")));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = BroadcastBus::default();
        let mut subscription = bus.subscribe("change.#").await.unwrap();
        let app = crate::routes::router(AppState::new(bus, None));

        let response = app
            .oneshot(post("/notifications/change.try", &change(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let message = subscription
            .next_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(message.topic, "change.try");
        assert_eq!(message.payload["payload"]["change"]["rev"], "abc123");
    }

    #[tokio::test]
    async fn test_signed_publish() {
        let bus = BroadcastBus::default();
        let app = crate::routes::router(AppState::new(bus, Some("s3cret".to_string())));
        let body = change();

        let unsigned = app
            .clone()
            .oneshot(post("/notifications/change.try", &body, None))
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let forged = app
            .clone()
            .oneshot(post(
                "/notifications/change.try",
                &body,
                Some(sign("wrong", &body)),
            ))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

        let signed = app
            .oneshot(post(
                "/notifications/change.try",
                &body,
                Some(sign("s3cret", &body)),
            ))
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let app = crate::routes::router(AppState::new(BroadcastBus::default(), None));
        let response = app
            .oneshot(post("/notifications/change.try", b"not json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
