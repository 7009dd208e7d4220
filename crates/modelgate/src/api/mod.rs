// crates/modelgate/src/api/mod.rs
//! HTTP handlers. Routing and layers live in [`crate::server`].

pub mod activity_api;
pub mod chat_api;
pub mod models_api;
pub mod system_api;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};

use crate::metrics;

/// Counts every routed request by route template and outcome.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let response = next.run(req).await;
    let status = response.status();
    let outcome = if status.is_success() {
        "ok"
    } else if status.is_client_error() {
        "client_error"
    } else {
        "error"
    };
    metrics::inc_request(&route, outcome);
    response
}
