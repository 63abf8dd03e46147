use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::Request;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use sentry::types::Dsn;
use sentry_tower::NewSentryLayer;
use tracing::{error, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};
use tracing_subscriber::{Layer, Registry};

use bucketgate::access::AccessPolicy;
use bucketgate::auth::BasicAuth;
use bucketgate::build_router;
use bucketgate::config::{Config, TlsConfig, load_from_env, load_from_file};
use bucketgate::handler::{AppState, BuildInfo, GatewaySettings};
use bucketgate::metrics::Metrics;
use bucketgate::store::{ObjectStoreClient, build_s3_store};

#[derive(Debug, Parser)]
#[command(name = "bucketgate", version)]
struct Args {
    #[arg(long, value_name = "env|path", default_value = "env")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let sentry_guard;
    let config: Config = match args.config.as_str() {
        "env" => {
            // load_from_env logs warnings, so tracing must be up before it runs.
            sentry_guard = init_sentry_from_env()?;
            init_tracing(sentry_guard.is_some());
            load_from_env().context("failed to load config from env")?
        }
        path => {
            let config = load_from_file(path)?;
            sentry_guard = init_sentry(&config)?;
            init_tracing(sentry_guard.is_some());
            config
        }
    };
    config.log_summary();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if let Err(err) = runtime.block_on(async_main(config, sentry_guard.is_some())) {
        error!(error = %err, "bucketgate failed to start");
        return Err(err);
    }

    Ok(())
}

async fn async_main(config: Config, sentry_enabled: bool) -> anyhow::Result<()> {
    let store = build_s3_store(&config.store).context("failed to build store")?;
    let metrics = Arc::new(Metrics::new());

    let state = AppState {
        client: Arc::new(ObjectStoreClient::single(config.store.bucket.clone(), store)),
        settings: GatewaySettings {
            bucket: config.store.bucket.clone(),
            key_prefix: config.key_prefix.clone(),
            headers: config.headers.clone(),
        },
        metrics: metrics.clone(),
        build: BuildInfo::current(),
    };
    let policy = AccessPolicy {
        basic_auth: BasicAuth::from_config(&config.basic_auth),
        access_log: config.access_log,
        metrics,
    };

    let mut app = build_router(Arc::new(state), Arc::new(policy));
    if sentry_enabled {
        app = app.layer(NewSentryLayer::<Request>::new_from_top());
    }

    run_server(app, &config.listen, config.tls()).await
}

async fn run_server(app: Router, listen: &str, tls: Option<&TlsConfig>) -> anyhow::Result<()> {
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        Some(tls) => {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("invalid listen address {listen}"))?;
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .context("failed to load TLS certificate")?;
            info!(listen = %listen, "listening (tls)");
            axum_server::bind_rustls(addr, rustls)
                .serve(service)
                .await
                .context("server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind to {listen}"))?;
            info!(listen = %listen, "listening");
            axum::serve(listener, service)
                .await
                .context("server failed")?;
        }
    }

    Ok(())
}

fn init_sentry(config: &Config) -> anyhow::Result<Option<sentry::ClientInitGuard>> {
    let Some(sentry_config) = config.sentry.as_ref() else {
        return Ok(None);
    };
    let dsn = sentry_config
        .dsn
        .parse::<Dsn>()
        .context("bad sentry DSN")?;

    let options = sentry::ClientOptions {
        dsn: Some(dsn),
        environment: sentry_config
            .environment
            .clone()
            .map(std::borrow::Cow::from),
        release: sentry::release_name!(),
        traces_sample_rate: sentry_config.traces_sample_rate.unwrap_or(0.1),
        debug: sentry_config.debug.unwrap_or(false),
        ..Default::default()
    };

    Ok(Some(sentry::init(options)))
}

fn init_sentry_from_env() -> anyhow::Result<Option<sentry::ClientInitGuard>> {
    let Some(dsn) = std::env::var("SENTRY_DSN").ok().filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let dsn = dsn.parse::<Dsn>().context("bad SENTRY_DSN")?;

    Ok(Some(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        environment: std::env::var("SENTRY_ENVIRONMENT")
            .ok()
            .map(std::borrow::Cow::from),
        release: sentry::release_name!(),
        traces_sample_rate: 0.1,
        ..Default::default()
    })))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn init_tracing(sentry_enabled: bool) {
    let enable_pretty = std::env::var("BUCKETGATE_LOG_PRETTY")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers = Vec::<BoxedLayer>::new();

    layers.push(
        make_fmt_layer(enable_pretty)
            .with_filter(filter.clone())
            .boxed(),
    );

    layers.push(ErrorLayer::default().boxed());

    if sentry_enabled {
        layers.push(sentry_tracing::layer().with_filter(filter).boxed());
    }

    let subscriber = tracing_subscriber::registry().with(layers);

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}

fn make_fmt_layer(enable_pretty: bool) -> BoxedLayer {
    if enable_pretty {
        fmt::layer()
            .pretty()
            .with_target(false)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .boxed()
    }
}
