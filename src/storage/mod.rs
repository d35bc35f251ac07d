//! Storage abstraction layer
//!
//! Provides unified interface for S3 and local filesystem storage

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::media::params::WriteParams;
use crate::Result;

pub mod local;
pub mod s3;
pub mod spool;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub e_tag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Stored `Content-Type`, when the backend keeps one
    pub content_type: Option<String>,
}

/// Result of a delimiter listing: common prefixes and object keys, both absolute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub prefixes: Vec<String>,
    pub keys: Vec<String>,
}

/// A finished multipart segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Response overrides merged into a presigned GET request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignParams {
    pub response_content_type: Option<String>,
    pub response_content_disposition: Option<String>,
    pub response_cache_control: Option<String>,
    pub version_id: Option<String>,
}

/// Storage backend trait
///
/// Implementations report absent keys as [`crate::Error::NotFound`] so callers can tell
/// them apart from transport failures.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Fetch object metadata without the body
    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Read object from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write object to storage
    async fn put(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<()>;

    /// Write object only if no object exists at `key`. Returns whether it was written.
    async fn put_if_absent(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<bool>;

    /// Delete object from storage. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every object under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// List immediate children of `prefix`, grouping deeper keys by `delimiter`
    async fn list_delimited(&self, prefix: &str, delimiter: &str) -> Result<Listing>;

    /// Start a multipart upload, returning its upload id
    async fn create_multipart(&self, key: &str, params: &WriteParams) -> Result<String>;

    /// Upload one segment, returning its entity tag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String>;

    /// Finish a multipart upload from its ordered segments
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Discard a multipart upload and its segments
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Produce a time-limited GET URL
    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        params: &PresignParams,
    ) -> Result<String>;

    /// Check if object exists
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(crate::Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Group flat keys under `prefix` the way a delimiter listing does.
pub fn group_by_delimiter<'a>(
    prefix: &str,
    delimiter: &str,
    keys: impl IntoIterator<Item = &'a str>,
) -> Listing {
    let mut prefixes = BTreeSet::new();
    let mut files = BTreeSet::new();

    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match (delimiter.is_empty(), rest.find(delimiter)) {
            (false, Some(idx)) => {
                prefixes.insert(format!("{}{}", prefix, &rest[..idx + delimiter.len()]));
            }
            _ => {
                files.insert(key.to_string());
            }
        }
    }

    Listing {
        prefixes: prefixes.into_iter().collect(),
        keys: files.into_iter().collect(),
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub enum StorageConfig {
    S3(s3::S3Settings),
    Local { root_path: String },
}

/// Create storage backend from config
pub async fn create_storage(config: StorageConfig) -> Result<Arc<dyn ObjectBackend>> {
    match config {
        StorageConfig::S3(settings) => {
            let backend = s3::S3Storage::new(settings).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Local { root_path } => {
            let backend = local::LocalStorage::new(root_path)?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_delimiter() {
        let keys = [
            "media/a.txt",
            "media/b/c.txt",
            "media/b/d/e.txt",
            "media/f/g.txt",
            "other/h.txt",
        ];
        let listing = group_by_delimiter("media/", "/", keys);
        assert_eq!(listing.prefixes, vec!["media/b/", "media/f/"]);
        assert_eq!(listing.keys, vec!["media/a.txt"]);
    }

    #[test]
    fn test_group_by_delimiter_empty_prefix() {
        let listing = group_by_delimiter("", "/", ["a.txt", "dir/b.txt"]);
        assert_eq!(listing.prefixes, vec!["dir/"]);
        assert_eq!(listing.keys, vec!["a.txt"]);
    }
}
