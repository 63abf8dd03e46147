use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::store::{ObjectClient, StoreError};

/// Literal that turns the path prefix up to and including it into a symlink.
pub const SYMLINK_MARKER: &str = "symlink.json";

const INDEX_DOCUMENT: &str = "index.html";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] StoreError),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Symlink {
    #[serde(rename = "URL", default)]
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    /// Key of the symlink object that was followed, if any.
    pub symlink: Option<String>,
}

pub struct Resolver<'a> {
    client: &'a dyn ObjectClient,
    bucket: &'a str,
    key_prefix: &'a str,
}

impl<'a> Resolver<'a> {
    pub fn new(client: &'a dyn ObjectClient, bucket: &'a str, key_prefix: &'a str) -> Self {
        Self {
            client,
            bucket,
            key_prefix,
        }
    }

    /// Maps a request path onto a store key.
    ///
    /// A path containing [`SYMLINK_MARKER`] has everything up to and including
    /// the marker replaced by the `URL` stored in that symlink object. This
    /// happens once; a target that contains the marker again is used as is.
    /// A path ending in `/` gets `index.html` appended.
    pub async fn resolve(&self, path: &str) -> Result<ResolvedKey, ResolveError> {
        let mut symlink = None;
        let mut path = path.to_string();

        if let Some((link, rest)) = split_at_symlink(&path) {
            let link_key = format!("{}{link}", self.key_prefix);
            let object = self.client.fetch(self.bucket, &link_key).await?;
            let body = object.into_bytes().await?;
            let target: Symlink = serde_json::from_slice(&body)?;
            debug!(symlink = %link_key, target = %target.url, "following symlink");

            path = format!("{}{rest}", target.url);
            symlink = Some(link_key);
        }

        Ok(ResolvedKey {
            key: format!("{}{}", self.key_prefix, with_index(path)),
            symlink,
        })
    }
}

/// Splits `path` right after the first occurrence of the marker. The match is
/// a plain substring search, not bound to segment boundaries.
fn split_at_symlink(path: &str) -> Option<(&str, &str)> {
    let idx = path.find(SYMLINK_MARKER)?;
    Some(path.split_at(idx + SYMLINK_MARKER.len()))
}

fn with_index(mut path: String) -> String {
    if path.ends_with('/') {
        path.push_str(INDEX_DOCUMENT);
    }
    path
}
