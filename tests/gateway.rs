use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Method, Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bucketgate::access::AccessPolicy;
use bucketgate::auth::BasicAuth;
use bucketgate::build_router;
use bucketgate::config::{BasicAuthConfig, HeaderOverrides, load_from_file};
use bucketgate::handler::{AppState, BuildInfo, GatewaySettings};
use bucketgate::metrics::Metrics;
use bucketgate::store::{FetchedObject, ObjectClient, ObjectStoreClient, StoreError};
use http_body_util::BodyExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tower::ServiceExt;

const BUCKET: &str = "site";
const PREFIX: &str = "public";

struct Gateway {
    client: Arc<dyn ObjectClient>,
    headers: HeaderOverrides,
    basic_auth: BasicAuthConfig,
    access_log: bool,
    build: BuildInfo,
}

impl Gateway {
    fn new(client: Arc<dyn ObjectClient>) -> Self {
        Self {
            client,
            headers: HeaderOverrides::default(),
            basic_auth: BasicAuthConfig::default(),
            access_log: true,
            build: BuildInfo::default(),
        }
    }

    fn router(self) -> Router {
        let metrics = Arc::new(Metrics::new());
        let state = AppState {
            client: self.client,
            settings: GatewaySettings {
                bucket: BUCKET.to_string(),
                key_prefix: PREFIX.to_string(),
                headers: self.headers,
            },
            metrics: metrics.clone(),
            build: self.build,
        };
        let policy = AccessPolicy {
            basic_auth: BasicAuth::from_config(&self.basic_auth),
            access_log: self.access_log,
            metrics,
        };
        build_router(Arc::new(state), Arc::new(policy))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))))
    }
}

async fn put_object(
    store: &InMemory,
    key: &str,
    body: &'static [u8],
    attrs: &[(Attribute, &'static str)],
) {
    let mut attributes = Attributes::new();
    for (attribute, value) in attrs {
        attributes.insert(attribute.clone(), (*value).into());
    }
    store
        .put_opts(
            &Path::parse(key).unwrap(),
            PutPayload::from_static(body),
            PutOptions {
                attributes,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

fn store_client(store: Arc<InMemory>) -> Arc<dyn ObjectClient> {
    Arc::new(ObjectStoreClient::single(BUCKET, store))
}

async fn get(router: Router, uri: &str) -> axum::response::Response {
    send(router, Method::GET, uri).await
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

fn header_str<'a>(response: &'a axum::response::Response, name: header::HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

async fn send(router: Router, method: Method, uri: &str) -> axum::response::Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    router.oneshot(request).await.unwrap()
}

/// Shared sink for a scoped `fmt` subscriber.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Requests `uri` from a gateway whose every fetch fails and returns the
/// access lines written for it.
async fn access_lines(access_log: bool, uri: &str) -> Vec<String> {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut gateway = Gateway::new(Arc::new(RecordingClient::default()));
    gateway.access_log = access_log;
    let response = get(gateway.router(), uri).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    logs.lines()
        .into_iter()
        .filter(|line| line.contains("[127.0.0.1:9999]"))
        .collect()
}

/// Counts fetches and fails every one of them.
#[derive(Default)]
struct RecordingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl ObjectClient for RecordingClient {
    async fn fetch(&self, _bucket: &str, key: &str) -> Result<FetchedObject, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend(object_store::Error::NotFound {
            path: key.to_string(),
            source: "no such key".into(),
        }))
    }
}

#[tokio::test]
async fn directory_path_serves_index_with_metadata() {
    let payload: &'static [u8] = b"<html><body>hello, bucketgate!</body></html>";
    let store = Arc::new(InMemory::new());
    put_object(
        &store,
        "public/a/b/index.html",
        &payload[..42],
        &[(Attribute::ContentType, "text/html")],
    )
    .await;

    let response = get(Gateway::new(store_client(store)).router(), "/a/b/").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("text/html"));
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), Some("42"));
    assert!(response.headers().get(header::LAST_MODIFIED).is_some());
    assert_eq!(body_bytes(response).await, &payload[..42]);
}

#[tokio::test]
async fn fetch_failure_is_500_with_error_text() {
    let client = Arc::new(RecordingClient::default());
    let expected = StoreError::Backend(object_store::Error::NotFound {
        path: "public/missing.txt".to_string(),
        source: "no such key".into(),
    })
    .to_string();

    let response = get(Gateway::new(client.clone()).router(), "/missing.txt").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(String::from_utf8(body_bytes(response).await).unwrap(), expected);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn symlink_redirects_one_hop() {
    let store = Arc::new(InMemory::new());
    put_object(
        &store,
        "public/docs/latest/symlink.json",
        br#"{"URL":"/docs/v2"}"#,
        &[],
    )
    .await;
    put_object(
        &store,
        "public/docs/v2/guide.txt",
        b"version two",
        &[(Attribute::ContentType, "text/plain")],
    )
    .await;

    let response = get(
        Gateway::new(store_client(store)).router(),
        "/docs/latest/symlink.json/guide.txt",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"version two");
}

#[tokio::test]
async fn malformed_symlink_is_500() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/symlink.json", b"{not json", &[]).await;

    let response = get(
        Gateway::new(store_client(store)).router(),
        "/symlink.json/file.txt",
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn percent_encoded_path_is_decoded() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/my file.txt", b"spaced", &[]).await;

    let response = get(Gateway::new(store_client(store)).router(), "/my%20file.txt").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"spaced");
}

#[tokio::test]
async fn reserved_characters_in_keys_are_served() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/a~b.txt", b"tilde", &[]).await;
    put_object(&store, "public/100%.txt", b"percent", &[]).await;
    let router = Gateway::new(store_client(store)).router();

    let response = get(router.clone(), "/a~b.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"tilde");

    let response = get(router, "/100%25.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"percent");
}

#[tokio::test]
async fn dot_segment_path_is_500() {
    let store = Arc::new(InMemory::new());

    let response = get(Gateway::new(store_client(store)).router(), "/a/%2E%2E/b").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        String::from_utf8(body_bytes(response).await)
            .unwrap()
            .starts_with("invalid object key")
    );
}

#[tokio::test]
async fn configured_cache_control_overrides_object() {
    let store = Arc::new(InMemory::new());
    put_object(
        &store,
        "public/app.js",
        b"console.log(1)",
        &[(Attribute::CacheControl, "max-age=60")],
    )
    .await;
    let mut gateway = Gateway::new(store_client(store));
    gateway.headers.cache_control = "no-store".to_string();

    let response = get(gateway.router(), "/app.js").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), Some("no-store"));
    assert!(response.headers().get(header::EXPIRES).is_none());
}

#[tokio::test]
async fn empty_object_has_no_content_length_header() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/empty", b"", &[]).await;

    let response = get(Gateway::new(store_client(store)).router(), "/empty").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn auth_gate_rejects_without_reaching_store() {
    let client = Arc::new(RecordingClient::default());
    let mut gateway = Gateway::new(client.clone());
    gateway.basic_auth = BasicAuthConfig {
        username: "alice".to_string(),
        password: "secret".to_string(),
    };

    let response = get(gateway.router(), "/index.html").await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        header_str(&response, header::WWW_AUTHENTICATE),
        Some(r#"Basic realm="REALM""#)
    );
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_gate_passes_valid_credentials() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/index.html", b"welcome", &[]).await;
    let mut gateway = Gateway::new(store_client(store));
    gateway.basic_auth = BasicAuthConfig {
        username: "alice".to_string(),
        password: "secret".to_string(),
    };

    let request = Request::builder()
        .uri("/")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("alice:secret")),
        )
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"welcome");
}

#[tokio::test]
async fn auth_gate_rejects_wrong_password() {
    let client = Arc::new(RecordingClient::default());
    let mut gateway = Gateway::new(client.clone());
    gateway.basic_auth = BasicAuthConfig {
        username: "alice".to_string(),
        password: "secret".to_string(),
    };

    let request = Request::builder()
        .uri("/")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("alice:guess")),
        )
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn version_route_bypasses_gateway() {
    let client = Arc::new(RecordingClient::default());
    let mut gateway = Gateway::new(client.clone());
    gateway.basic_auth = BasicAuthConfig {
        username: "alice".to_string(),
        password: "secret".to_string(),
    };
    gateway.build = BuildInfo {
        version: Some("1.0.0"),
        date: Some("2024-05-01"),
    };

    let response = get(gateway.router(), "/--version").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        String::from_utf8(body_bytes(response).await).unwrap(),
        "version: 1.0.0 (built at 2024-05-01)"
    );
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn version_route_answers_any_method() {
    let client = Arc::new(RecordingClient::default());
    let mut gateway = Gateway::new(client.clone());
    gateway.build = BuildInfo {
        version: Some("1.0.0"),
        date: Some("2024-05-01"),
    };

    let response = send(gateway.router(), Method::POST, "/--version").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        String::from_utf8(body_bytes(response).await).unwrap(),
        "version: 1.0.0 (built at 2024-05-01)"
    );
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn version_route_without_build_info_is_empty() {
    let response = get(
        Gateway::new(Arc::new(RecordingClient::default())).router(),
        "/--version",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn metrics_route_reports_requests() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/index.html", b"home", &[]).await;
    let router = Gateway::new(store_client(store)).router();

    let response = get(router.clone(), "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = get(router.clone(), "/missing").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = get(router, "/--metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains(r#"bucketgate_requests_total{method="GET",status="200"} 1"#));
    assert!(text.contains(r#"bucketgate_requests_total{method="GET",status="500"} 1"#));
    assert!(text.contains(r#"bucketgate_upstream_err_total{error_kind="not_found"} 1"#));
}

#[tokio::test]
async fn symlink_fetches_are_metered() {
    let store = Arc::new(InMemory::new());
    put_object(&store, "public/latest/symlink.json", br#"{"URL":"/v2"}"#, &[]).await;
    put_object(&store, "public/v2/app.js", b"two", &[]).await;
    let router = Gateway::new(store_client(store)).router();

    let response = get(router.clone(), "/latest/symlink.json/app.js").await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = get(router.clone(), "/gone/symlink.json/app.js").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = get(router, "/--metrics").await;
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("bucketgate_upstream_ok_total 2"));
    assert!(text.contains(r#"bucketgate_upstream_err_total{error_kind="not_found"} 1"#));
    assert!(!text.contains("bad_symlink"));
    assert!(text.contains("bucketgate_symlink_total 1"));
    assert!(text.contains(r#"bucketgate_upstream_latency_ms_count{outcome="ok"} 2"#));
    assert!(text.contains(r#"bucketgate_upstream_latency_ms_count{outcome="error"} 1"#));
}

#[tokio::test]
async fn access_log_writes_one_line_per_request() {
    let lines = access_lines(true, "/missing").await;

    assert_eq!(lines.len(), 1, "{lines:?}");
    assert!(lines[0].contains("500 GET /missing"), "{}", lines[0]);
}

#[tokio::test]
async fn access_log_disabled_writes_nothing() {
    let lines = access_lines(false, "/missing").await;

    assert!(lines.is_empty(), "{lines:?}");
}

#[test]
fn yaml_config_file_loads() {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    file.write_all(
        br#"listen: "127.0.0.1:8080"
key_prefix: "public"
store:
  bucket: site
  region: eu-central-1
basic_auth:
  username: alice
  password: secret
access_log: true
tls:
  cert_path: /etc/tls/cert.pem
  key_path: /etc/tls/key.pem
"#,
    )
    .expect("write config");

    let config = load_from_file(file.path()).unwrap();

    assert_eq!(config.listen, "127.0.0.1:8080");
    assert_eq!(config.key_prefix, "public");
    assert_eq!(config.store.bucket, "site");
    assert_eq!(config.store.region, "eu-central-1");
    assert!(BasicAuth::from_config(&config.basic_auth).is_some());
    assert!(config.access_log);
    assert!(config.tls().is_some());
}

#[test]
fn missing_config_file_is_error() {
    let err = load_from_file("/nonexistent/bucketgate.yaml").unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}
