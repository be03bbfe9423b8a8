//! API routes.

pub mod health;
pub mod notifications;

use crate::AppState;
use axum::Router;

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/notifications", notifications::router())
        .merge(health::router())
        .with_state(state)
}
