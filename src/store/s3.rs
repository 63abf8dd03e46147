use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use tracing::info_span;

use crate::config::StoreConfig;

/// Builds the S3 store. Credentials not present in `config` fall back to the
/// standard `AWS_*` environment variables.
pub fn build_s3_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let span = info_span!(
        "s3_store_init",
        bucket = %config.bucket,
        region = %config.region,
        endpoint = %config.endpoint.as_deref().unwrap_or("default"),
    );
    let _enter = span.enter();

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region);

    if let Some(access_key) = config.access_key.as_deref() {
        builder = builder.with_access_key_id(access_key);
    }
    if let Some(secret_key) = config.secret_key.as_deref() {
        builder = builder.with_secret_access_key(secret_key);
    }
    if let Some(endpoint) = config.endpoint.as_deref() {
        builder = builder.with_endpoint(endpoint);
    }
    if config.allow_http.unwrap_or(false) {
        builder = builder.with_allow_http(true);
    }

    Ok(Arc::new(builder.build()?))
}
