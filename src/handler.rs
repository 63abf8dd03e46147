use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Response, StatusCode, Uri, header};
use axum::response::IntoResponse;
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::HeaderOverrides;
use crate::headers::effective_headers;
use crate::metrics::{Metrics, UpstreamErrorKind};
use crate::resolve::{ResolveError, Resolver};
use crate::store::{FetchedObject, ObjectClient, StoreError};

/// Read-only settings the pipeline needs for every request.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bucket: String,
    pub key_prefix: String,
    pub headers: HeaderOverrides,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildInfo {
    pub version: Option<&'static str>,
    pub date: Option<&'static str>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: Some(env!("CARGO_PKG_VERSION")),
            date: option_env!("BUCKETGATE_BUILD_DATE"),
        }
    }

    pub fn describe(&self) -> Option<String> {
        match (self.version, self.date) {
            (Some(version), Some(date)) if !version.is_empty() && !date.is_empty() => {
                Some(format!("version: {version} (built at {date})"))
            }
            _ => None,
        }
    }
}

pub struct AppState {
    pub client: Arc<dyn ObjectClient>,
    pub settings: GatewaySettings,
    pub metrics: Arc<Metrics>,
    pub build: BuildInfo,
}

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Response<Body>, GatewayError> {
    let path = percent_decode_str(uri.path()).decode_utf8_lossy();
    let client = MeteredClient {
        inner: state.client.as_ref(),
        metrics: &state.metrics,
    };

    let resolver = Resolver::new(&client, &state.settings.bucket, &state.settings.key_prefix);
    let resolved = resolver.resolve(&path).await.inspect_err(|err| {
        if let ResolveError::Parse(_) = err {
            state.metrics.inc_upstream_err(UpstreamErrorKind::BadSymlink);
        }
    })?;
    if resolved.symlink.is_some() {
        state.metrics.inc_symlink();
    }

    let object = client.fetch(&state.settings.bucket, &resolved.key).await?;
    debug!(key = %resolved.key, "serving object");

    let headers = effective_headers(&object.metadata, &state.settings.headers);
    let key = resolved.key;
    let body = object.body.inspect_err(move |err| {
        warn!(key = %key, error = %err, "object body stream failed");
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Records latency and outcome of every store fetch made for a request,
/// symlink lookups included.
struct MeteredClient<'a> {
    inner: &'a dyn ObjectClient,
    metrics: &'a Metrics,
}

#[async_trait]
impl ObjectClient for MeteredClient<'_> {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, StoreError> {
        let start = Instant::now();
        let result = self.inner.fetch(bucket, key).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                self.metrics.observe_upstream_latency_ms("ok", elapsed_ms);
                self.metrics.inc_upstream_ok();
            }
            Err(err) => {
                self.metrics.observe_upstream_latency_ms("error", elapsed_ms);
                self.metrics
                    .inc_upstream_err(UpstreamErrorKind::from_store_error(err));
                warn!(key = %key, error = %err, "object fetch failed");
            }
        }

        result
    }
}

pub async fn version(State(state): State<Arc<AppState>>) -> Response<Body> {
    match state.build.describe() {
        Some(text) => text.into_response(),
        None => StatusCode::OK.into_response(),
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response<Body> {
    let body = state.metrics.render_prometheus();
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Every failure in the pipeline is reported as a 500 carrying the error text.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fetch(#[from] StoreError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        (self.status(), self.to_string()).into_response()
    }
}
