use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request};
use axum::middleware;
use axum::routing::{any, get};
use tower_http::trace::TraceLayer;
use tracing::info_span;

pub mod access;
pub mod auth;
pub mod config;
pub mod handler;
pub mod headers;
pub mod metrics;
pub mod resolve;
pub mod store;

use access::AccessPolicy;
use handler::AppState;

pub const VERSION_PATH: &str = "/--version";
pub const METRICS_PATH: &str = "/--metrics";

/// Diagnostic routes are served directly; every other path goes through the
/// access wrapper into the object pipeline.
pub fn build_router(state: Arc<AppState>, policy: Arc<AccessPolicy>) -> Router {
    let gateway = Router::new()
        .fallback(handler::get_object)
        .layer(middleware::from_fn_with_state(
            policy,
            access::access_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route(VERSION_PATH, any(handler::version))
        .route(METRICS_PATH, get(handler::metrics))
        .with_state(state)
        .fallback_service(gateway)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let op = match request.uri().path() {
                    VERSION_PATH => "http.r.version",
                    METRICS_PATH => "http.r.metrics",
                    _ => "http.r.get_object",
                };
                let client_addr = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0);

                info_span!(
                    "http_request",
                    method = ?request.method(),
                    path = %request.uri().path(),
                    client_addr = ?client_addr,
                    "sentry.op" = op,
                )
            }),
        )
}
