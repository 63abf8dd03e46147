use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::auth::{BasicAuth, CHALLENGE};
use crate::metrics::Metrics;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Cross-cutting behaviour wrapped around the gateway handler.
#[derive(Debug)]
pub struct AccessPolicy {
    pub basic_auth: Option<BasicAuth>,
    pub access_log: bool,
    pub metrics: Arc<Metrics>,
}

/// One finished request, as written to the access log.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub client: String,
    pub elapsed: Duration,
    pub status: StatusCode,
    pub method: Method,
    pub path: String,
}

impl AccessRecord {
    pub fn emit(&self) {
        info!(
            target: "access",
            client = %self.client,
            elapsed_secs = self.elapsed.as_secs_f64(),
            status = self.status.as_u16(),
            method = %self.method,
            path = %self.path,
            "{}",
            self
        );
    }
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:.3} {} {} {}",
            self.client,
            self.elapsed.as_secs_f64(),
            self.status.as_u16(),
            self.method,
            self.path
        )
    }
}

/// Gate on basic auth (when configured), run the handler, then record the
/// outcome. Rejected requests never reach the handler and are not logged.
pub async fn access_middleware(
    State(policy): State<Arc<AccessPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();

    if let Some(auth) = &policy.basic_auth
        && let Err(err) = auth.verify(request.headers())
    {
        warn!(method = %method, path = %request.uri().path(), error = %err, "basic auth rejected");
        policy.metrics.inc_auth_fail(method.as_str());
        return unauthorized();
    }

    let started = Instant::now();
    let client = client_address(
        request.headers(),
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
    );
    let path = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    let record = AccessRecord {
        client,
        elapsed: started.elapsed(),
        status: response.status(),
        method,
        path,
    };
    policy
        .metrics
        .inc_requests(record.method.as_str(), record.status.as_u16());
    if policy.access_log {
        record.emit();
    }

    response
}

fn unauthorized() -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        StatusCode::UNAUTHORIZED
            .canonical_reason()
            .unwrap_or("Unauthorized"),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
    response
}

/// `X-Forwarded-For` verbatim when present and non-empty, else the peer address.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.to_string()))
        .unwrap_or_else(|| "-".to_string())
}
