use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_PORT: &str = "80";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: String,
    pub store: StoreConfig,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub headers: HeaderOverrides,
    #[serde(default)]
    pub basic_auth: BasicAuthConfig,
    #[serde(default)]
    pub access_log: bool,
    pub tls: Option<TlsConfig>,
    pub sentry: Option<SentryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
    pub allow_http: Option<bool>,
}

/// Static values that win over the object's own `Cache-Control` / `Expires`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderOverrides {
    #[serde(default)]
    pub cache_control: String,
    #[serde(default)]
    pub expires: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentryConfig {
    pub dsn: String,
    pub environment: Option<String>,
    pub traces_sample_rate: Option<f32>,
    pub debug: Option<bool>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl Config {
    /// TLS settings, only when both halves of the key pair are present.
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls
            .as_ref()
            .filter(|tls| !tls.cert_path.is_empty() && !tls.key_path.is_empty())
    }

    pub fn log_summary(&self) {
        info!(bucket = %self.store.bucket, "proxying to bucket");
        info!(region = %self.store.region, "store region");
        if !self.key_prefix.is_empty() {
            info!(key_prefix = %self.key_prefix, "key prefix");
        }
        if self.tls().is_some() {
            info!("TLS enabled");
        }
        if !self.basic_auth.username.is_empty() && !self.basic_auth.password.is_empty() {
            info!(user = %self.basic_auth.username, "basic authentication enabled");
        }
    }
}

pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw).context("failed to parse config file")
}

pub fn load_from_env() -> anyhow::Result<Config> {
    from_env_vars(env::vars())
}

pub(crate) fn from_env_vars<I>(vars: I) -> anyhow::Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut bucket = None;
    let mut region = None;
    let mut port = None;
    let mut access_key = None;
    let mut secret_key = None;
    let mut endpoint = None;
    let mut allow_http = None;
    let mut key_prefix = String::new();
    let mut headers = HeaderOverrides::default();
    let mut basic_auth = BasicAuthConfig::default();
    let mut access_log = false;
    let mut cert_path = String::new();
    let mut key_path = String::new();
    let mut sentry_dsn = None;
    let mut sentry_environment = None;

    for (key, value) in vars {
        match key.as_str() {
            "AWS_S3_BUCKET" => bucket = Some(value).filter(|v| !v.is_empty()),
            "AWS_REGION" => region = Some(value).filter(|v| !v.is_empty()),
            "AWS_S3_KEY_PREFIX" => key_prefix = value,
            "AWS_ACCESS_KEY_ID" => access_key = Some(value).filter(|v| !v.is_empty()),
            "AWS_SECRET_ACCESS_KEY" => secret_key = Some(value).filter(|v| !v.is_empty()),
            "AWS_ENDPOINT_URL" => endpoint = Some(value).filter(|v| !v.is_empty()),
            "AWS_ALLOW_HTTP" => {
                allow_http = Some(parse_bool(&value).with_context(|| "invalid AWS_ALLOW_HTTP")?)
            }
            "HTTP_CACHE_CONTROL" => headers.cache_control = value,
            "HTTP_EXPIRES" => headers.expires = value,
            "BASIC_AUTH_USER" => basic_auth.username = value,
            "BASIC_AUTH_PASS" => basic_auth.password = value,
            "APP_PORT" => port = Some(value).filter(|v| !v.is_empty()),
            "ACCESS_LOG" => {
                access_log = match parse_bool(&value) {
                    Ok(enabled) => enabled,
                    Err(err) => {
                        warn!(error = %err, "ignoring ACCESS_LOG");
                        false
                    }
                }
            }
            "SSL_CERT_PATH" => cert_path = value,
            "SSL_KEY_PATH" => key_path = value,
            "SENTRY_DSN" => sentry_dsn = Some(value).filter(|v| !v.is_empty()),
            "SENTRY_ENVIRONMENT" => sentry_environment = Some(value).filter(|v| !v.is_empty()),
            _ => {}
        }
    }

    if access_key.is_none() {
        warn!("environment variable AWS_ACCESS_KEY_ID is not defined");
    }
    if secret_key.is_none() {
        warn!("environment variable AWS_SECRET_ACCESS_KEY is not defined");
    }

    let bucket = bucket.ok_or_else(|| anyhow!("missing required environment variable AWS_S3_BUCKET"))?;
    let port = port.unwrap_or_else(|| DEFAULT_PORT.to_string());

    let tls = if cert_path.is_empty() && key_path.is_empty() {
        None
    } else {
        Some(TlsConfig {
            cert_path,
            key_path,
        })
    };

    Ok(Config {
        listen: format!("0.0.0.0:{port}"),
        store: StoreConfig {
            bucket,
            region: region.unwrap_or_else(default_region),
            access_key,
            secret_key,
            endpoint,
            allow_http,
        },
        key_prefix,
        headers,
        basic_auth,
        access_log,
        tls,
        sentry: sentry_dsn.map(|dsn| SentryConfig {
            dsn,
            environment: sentry_environment,
            traces_sample_rate: None,
            debug: None,
        }),
    })
}

/// `1`, `t` and `true` (lower, upper or title case) and their false
/// counterparts. Anything else is an error.
fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(anyhow!("invalid boolean: {value}")),
    }
}
