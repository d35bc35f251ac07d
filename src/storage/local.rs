//! Local filesystem storage backend
//!
//! Objects are plain files below `root_path`. Multipart segments are staged in
//! memory until the upload is completed or aborted. Content types given on
//! write are remembered for the lifetime of the process only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::media::params::WriteParams;
use crate::{Error, Result};

use super::{group_by_delimiter, CompletedPart, Listing, ObjectBackend, ObjectMeta, PresignParams};

struct PendingUpload {
    key: String,
    content_type: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

/// Local filesystem storage
pub struct LocalStorage {
    root_path: PathBuf,
    uploads: DashMap<String, PendingUpload>,
    content_types: DashMap<String, String>,
}

impl LocalStorage {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        std::fs::create_dir_all(&root_path)?;
        Ok(Self {
            root_path,
            uploads: DashMap::new(),
            content_types: DashMap::new(),
        })
    }

    fn resolve_path(&self, key: &str) -> PathBuf {
        self.root_path.join(key)
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    fn remember_type(&self, key: &str, content_type: &str) {
        if content_type.is_empty() {
            self.content_types.remove(key);
        } else {
            self.content_types
                .insert(key.to_string(), content_type.to_string());
        }
    }

    async fn write_file(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    async fn meta_for(&self, key: &str, path: &Path) -> Result<ObjectMeta> {
        let metadata = match fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(Error::not_found(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(key))
            }
            Err(e) => return Err(e.into()),
        };
        let modified = metadata.modified().ok();

        Ok(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            e_tag: modified.and_then(|t| stat_etag(metadata.len(), t)),
            last_modified: modified.map(DateTime::<Utc>::from),
            content_type: self.content_types.get(key).map(|t| t.value().clone()),
        })
    }

    /// Every file below the root as a `/`-separated key
    async fn walk(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root_path) {
                    if let Some(s) = relative.to_str() {
                        keys.push(s.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("\"{:08x}\"", crc32fast::hash(data))
}

/// Entity tag from size and modification time, so `head` never reads the body
fn stat_etag(len: u64, modified: SystemTime) -> Option<String> {
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(format!("\"{:x}-{:x}\"", len, since_epoch.as_nanos()))
}

#[async_trait]
impl ObjectBackend for LocalStorage {
    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let path = self.resolve_path(key);
        self.meta_for(key, &path).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve_path(key);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<()> {
        self.write_file(key, &data).await?;
        self.remember_type(key, &params.content_type);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<bool> {
        let path = self.resolve_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(&data).await?;
        file.flush().await?;
        self.remember_type(key, &params.content_type);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key);
        self.content_types.remove(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        for key in self.walk().await? {
            if key.starts_with(prefix) {
                let path = self.resolve_path(&key);
                results.push(self.meta_for(&key, &path).await?);
            }
        }
        Ok(results)
    }

    async fn list_delimited(&self, prefix: &str, delimiter: &str) -> Result<Listing> {
        let keys = self.walk().await?;
        Ok(group_by_delimiter(
            prefix,
            delimiter,
            keys.iter().map(String::as_str),
        ))
    }

    async fn create_multipart(&self, key: &str, params: &WriteParams) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: params.content_type.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::not_found(format!("{key} (upload {upload_id})")))?;

        let e_tag = etag_for(&data);
        upload.parts.insert(part_number, (e_tag.clone(), data));
        Ok(e_tag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .filter(|(_, u)| u.key == key)
            .ok_or_else(|| Error::not_found(format!("{key} (upload {upload_id})")))?;

        if parts.is_empty() {
            return Err(Error::storage(format!(
                "multipart upload {upload_id} completed without parts"
            )));
        }

        let mut body = BytesMut::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(Error::storage(format!(
                    "parts for {key} are not in ascending order"
                )));
            }
            previous = part.part_number;

            match upload.parts.get(&part.part_number) {
                Some((e_tag, data)) if *e_tag == part.e_tag => body.extend_from_slice(data),
                _ => {
                    return Err(Error::storage(format!(
                        "invalid part {} for {}",
                        part.part_number, key
                    )))
                }
            }
        }

        self.write_file(key, &body).await?;
        self.remember_type(key, &upload.content_type);
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.remove(upload_id);
        Ok(())
    }

    async fn presign_get(
        &self,
        _key: &str,
        _expires_in: Duration,
        _params: &PresignParams,
    ) -> Result<String> {
        Err(Error::Unsupported(
            "presigned URLs require the S3 backend".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> WriteParams {
        WriteParams::default()
    }

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let key = "test/file.txt";
        let data = Bytes::from("hello world");

        storage.put(key, data.clone(), &params()).await.unwrap();
        assert!(storage.exists(key).await.unwrap());
        assert_eq!(storage.head(key).await.unwrap().size, 11);

        let retrieved = storage.get(key).await.unwrap();
        assert_eq!(retrieved, data);

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await.unwrap());
        // deleting twice is fine
        storage.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        assert!(matches!(storage.get("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(storage.head("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        assert!(storage.put_if_absent("a/b", Bytes::from("x"), &params()).await.unwrap());
        assert!(!storage.put_if_absent("a/b", Bytes::new(), &params()).await.unwrap());
        assert_eq!(storage.get("a/b").await.unwrap(), Bytes::from("x"));
    }

    #[tokio::test]
    async fn test_head_etag_comes_from_file_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        storage.put("clip.mp4", Bytes::from(vec![1u8; 4096]), &params()).await.unwrap();
        let first = storage.head("clip.mp4").await.unwrap();
        let e_tag = first.e_tag.clone().unwrap();
        assert!(e_tag.starts_with("\"1000-"), "unexpected etag {e_tag}");
        assert_eq!(storage.head("clip.mp4").await.unwrap().e_tag, first.e_tag);

        storage.put("clip.mp4", Bytes::from(vec![2u8; 10]), &params()).await.unwrap();
        let second = storage.head("clip.mp4").await.unwrap();
        assert_eq!(second.size, 10);
        assert_ne!(second.e_tag, first.e_tag);
    }

    #[tokio::test]
    async fn test_content_type_is_remembered() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();
        let markdown = WriteParams {
            content_type: "text/markdown".to_string(),
            ..WriteParams::default()
        };

        storage.put("notes.txt", Bytes::from("# week 1"), &markdown).await.unwrap();
        assert_eq!(
            storage.head("notes.txt").await.unwrap().content_type.as_deref(),
            Some("text/markdown")
        );

        let id = storage.create_multipart("slides.bin", &markdown).await.unwrap();
        let e_tag = storage.upload_part("slides.bin", &id, 1, Bytes::from("x")).await.unwrap();
        storage
            .complete_multipart("slides.bin", &id, &[CompletedPart { part_number: 1, e_tag }])
            .await
            .unwrap();
        assert_eq!(
            storage.head("slides.bin").await.unwrap().content_type.as_deref(),
            Some("text/markdown")
        );

        storage.delete("notes.txt").await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"plain").unwrap();
        assert_eq!(storage.head("notes.txt").await.unwrap().content_type, None);
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let id = storage.create_multipart("big.bin", &params()).await.unwrap();
        let e1 = storage.upload_part("big.bin", &id, 1, Bytes::from("abc")).await.unwrap();
        let e2 = storage.upload_part("big.bin", &id, 2, Bytes::from("def")).await.unwrap();
        assert_eq!(storage.pending_uploads(), 1);

        storage
            .complete_multipart(
                "big.bin",
                &id,
                &[
                    CompletedPart { part_number: 1, e_tag: e1 },
                    CompletedPart { part_number: 2, e_tag: e2 },
                ],
            )
            .await
            .unwrap();

        assert_eq!(storage.get("big.bin").await.unwrap(), Bytes::from("abcdef"));
        assert_eq!(storage.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_list_and_delimited_listing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        for key in ["media/a.txt", "media/sub/b.txt", "other.txt"] {
            storage.put(key, Bytes::from("1"), &params()).await.unwrap();
        }

        let all = storage.list("media/").await.unwrap();
        let keys: Vec<_> = all.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["media/a.txt", "media/sub/b.txt"]);

        let listing = storage.list_delimited("media/", "/").await.unwrap();
        assert_eq!(listing.prefixes, vec!["media/sub/"]);
        assert_eq!(listing.keys, vec!["media/a.txt"]);
    }
}
