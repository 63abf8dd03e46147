use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::{Attribute, Attributes, GetOptions, ObjectStore};
use thiserror::Error;
use time::OffsetDateTime;

mod s3;

pub use s3::build_s3_store;

pub type StoreMap = HashMap<String, Arc<dyn ObjectStore>>;

pub type BodyStream = BoxStream<'static, Result<Bytes, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown bucket: {0}")]
    UnknownBucket(String),
    #[error("invalid object key {key}: {source}")]
    InvalidKey {
        key: String,
        source: object_store::path::Error,
    },
    #[error(transparent)]
    Backend(#[from] object_store::Error),
}

/// Metadata the store reports for an object. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_range: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    pub last_modified: Option<OffsetDateTime>,
}

pub struct FetchedObject {
    pub body: BodyStream,
    pub metadata: ObjectMetadata,
}

impl FetchedObject {
    pub fn new(body: BodyStream, metadata: ObjectMetadata) -> Self {
        Self { body, metadata }
    }

    /// Drains the body into memory. Only meant for small objects such as symlinks.
    pub async fn into_bytes(self) -> Result<Bytes, StoreError> {
        let buf = self
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedObject")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, StoreError>;
}

/// [`ObjectClient`] backed by `object_store`, one store per bucket name.
pub struct ObjectStoreClient {
    stores: StoreMap,
}

impl ObjectStoreClient {
    pub fn new(stores: StoreMap) -> Self {
        Self { stores }
    }

    pub fn single(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        let mut stores = StoreMap::new();
        stores.insert(bucket.into(), store);
        Self::new(stores)
    }
}

#[async_trait]
impl ObjectClient for ObjectStoreClient {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject, StoreError> {
        let store = self
            .stores
            .get(bucket)
            .ok_or_else(|| StoreError::UnknownBucket(bucket.to_string()))?;

        let location = object_location(key)?;
        let result = store.get_opts(&location, GetOptions::default()).await?;

        let metadata = ObjectMetadata {
            content_length: u64::try_from(result.meta.size).ok(),
            last_modified: Some(OffsetDateTime::from(SystemTime::from(
                result.meta.last_modified,
            ))),
            ..metadata_from_attributes(&result.attributes)
        };
        let body = result.into_stream().map_err(StoreError::from).boxed();

        Ok(FetchedObject::new(body, metadata))
    }
}

/// Maps a key onto a store path verbatim. Empty segments (a leading `/`,
/// doubled separators) are dropped; nothing is percent-encoded.
fn object_location(key: &str) -> Result<object_store::path::Path, StoreError> {
    let joined = key
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    object_store::path::Path::parse(joined).map_err(|source| StoreError::InvalidKey {
        key: key.to_string(),
        source,
    })
}

fn metadata_from_attributes(attributes: &Attributes) -> ObjectMetadata {
    let get = |attribute: Attribute| attributes.get(&attribute).map(|value| value.to_string());

    ObjectMetadata {
        content_type: get(Attribute::ContentType),
        content_encoding: get(Attribute::ContentEncoding),
        content_language: get(Attribute::ContentLanguage),
        content_disposition: get(Attribute::ContentDisposition),
        cache_control: get(Attribute::CacheControl),
        ..Default::default()
    }
}
