use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    NotFound,
    PermissionDenied,
    Unauthenticated,
    UnknownBucket,
    InvalidKey,
    BadSymlink,
    Other,
}

impl UpstreamErrorKind {
    pub fn from_store_error(error: &StoreError) -> Self {
        match error {
            StoreError::UnknownBucket(_) => Self::UnknownBucket,
            StoreError::InvalidKey { .. } => Self::InvalidKey,
            StoreError::Backend(object_store::Error::NotFound { .. }) => Self::NotFound,
            StoreError::Backend(object_store::Error::PermissionDenied { .. }) => {
                Self::PermissionDenied
            }
            StoreError::Backend(object_store::Error::Unauthenticated { .. }) => {
                Self::Unauthenticated
            }
            StoreError::Backend(_) => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::UnknownBucket => "unknown_bucket",
            Self::InvalidKey => "invalid_key",
            Self::BadSymlink => "bad_symlink",
            Self::Other => "other",
        }
    }
}

#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    requests_total: CounterVec,
    auth_fail_total: CounterVec,
    symlink_total: IntCounter,
    upstream_ok_total: IntCounter,
    upstream_err_total: CounterVec,
    upstream_latency_ms: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                "bucketgate_requests_total",
                "Total requests served by bucketgate",
            ),
            &["method", "status"],
        )
        .expect("requests_total metrics");
        let auth_fail_total = CounterVec::new(
            Opts::new("bucketgate_auth_fail_total", "Total authentication failures"),
            &["method"],
        )
        .expect("auth_fail_total metrics");
        let symlink_total = IntCounter::new("bucketgate_symlink_total", "Total symlinks followed")
            .expect("symlink_total metrics");
        let upstream_ok_total =
            IntCounter::new("bucketgate_upstream_ok_total", "Total upstream successes")
                .expect("upstream_ok_total metrics");
        let upstream_err_total = CounterVec::new(
            Opts::new("bucketgate_upstream_err_total", "Total upstream errors"),
            &["error_kind"],
        )
        .expect("upstream_err_total metrics");

        let buckets = vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0,
        ];
        let upstream_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "bucketgate_upstream_latency_ms",
                "Upstream fetch latency in milliseconds",
            )
            .buckets(buckets),
            &["outcome"],
        )
        .expect("upstream_latency_ms metrics");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(auth_fail_total.clone()))
            .expect("register auth_fail_total");
        registry
            .register(Box::new(symlink_total.clone()))
            .expect("register symlink_total");
        registry
            .register(Box::new(upstream_ok_total.clone()))
            .expect("register upstream_ok_total");
        registry
            .register(Box::new(upstream_err_total.clone()))
            .expect("register upstream_err_total");
        registry
            .register(Box::new(upstream_latency_ms.clone()))
            .expect("register upstream_latency_ms");

        Self {
            registry,
            requests_total,
            auth_fail_total,
            symlink_total,
            upstream_ok_total,
            upstream_err_total,
            upstream_latency_ms,
        }
    }

    pub fn inc_requests(&self, method: &str, status: u16) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, status.as_str()])
            .inc();
    }

    pub fn inc_auth_fail(&self, method: &str) {
        self.auth_fail_total.with_label_values(&[method]).inc();
    }

    pub fn inc_symlink(&self) {
        self.symlink_total.inc();
    }

    pub fn inc_upstream_ok(&self) {
        self.upstream_ok_total.inc();
    }

    pub fn inc_upstream_err(&self, error_kind: UpstreamErrorKind) {
        self.upstream_err_total
            .with_label_values(&[error_kind.as_str()])
            .inc();
    }

    pub fn observe_upstream_latency_ms(&self, outcome: &str, value_ms: u64) {
        self.upstream_latency_ms
            .with_label_values(&[outcome])
            .observe(value_ms as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
