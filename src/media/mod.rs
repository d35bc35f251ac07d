//! Media storage gateway
//!
//! [`MediaStorage`] turns logical media names into backend keys below the
//! configured `location` and runs the storage operations the web layer needs:
//! save, open, delete, exists, size, listdir, url and name selection.

use std::io::{Cursor, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::cache::{CacheConfig, EntryCache, Lookup};
use crate::storage::{ObjectBackend, ObjectMeta, PresignParams};
use crate::{Error, Result};

pub mod file;
pub mod naming;
pub mod params;

pub use file::{Access, MediaFile, MediaReader, MediaWriter, OpenMode, DEFAULT_BUFFER_SIZE};
pub use naming::NameCharset;
pub use params::{ObjectParameters, WriteParams};

pub const DEFAULT_ACL: &str = "public-read";
pub const DEFAULT_EXPIRE_SECS: u64 = 3600;

/// Runtime configuration of the gateway
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Root prefix every name is resolved below
    pub location: String,
    pub file_overwrite: bool,
    pub object_parameters: ObjectParameters,
    pub file_name_charset: NameCharset,
    /// In-memory ceiling of upload/download buffers; 0 never spills to disk
    pub max_memory_size: usize,
    pub custom_domain: Option<String>,
    pub default_acl: Option<String>,
    pub expire: Duration,
    /// Multipart flush threshold for streamed writes
    pub file_buffer_size: usize,
    pub cache: CacheConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            location: String::new(),
            file_overwrite: true,
            object_parameters: ObjectParameters::default(),
            file_name_charset: NameCharset::Utf8,
            max_memory_size: 0,
            custom_domain: None,
            default_acl: Some(DEFAULT_ACL.to_string()),
            expire: Duration::from_secs(DEFAULT_EXPIRE_SECS),
            file_buffer_size: DEFAULT_BUFFER_SIZE,
            cache: CacheConfig::default(),
        }
    }
}

/// Content handed to [`MediaStorage::save`]
pub struct Content<R> {
    reader: R,
    content_type: Option<String>,
}

impl Content<Cursor<Bytes>> {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(Cursor::new(data.into()))
    }
}

impl<R> Content<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Rewind and read the whole stream
    async fn read_all(&mut self) -> Result<Bytes> {
        self.reader.seek(SeekFrom::Start(0)).await?;
        let mut data = Vec::new();
        self.reader.read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }
}

/// Storage gateway over an object backend
pub struct MediaStorage {
    backend: Arc<dyn ObjectBackend>,
    config: MediaConfig,
    entries: Arc<EntryCache>,
}

impl MediaStorage {
    pub fn new(backend: Arc<dyn ObjectBackend>, config: MediaConfig) -> Self {
        let entries = Arc::new(EntryCache::new(config.cache.clone()));
        Self {
            backend,
            config,
            entries,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn entries(&self) -> &EntryCache {
        &self.entries
    }

    /// Normalized name for `name`, without encoding
    pub fn normalize(&self, name: &str) -> Result<String> {
        naming::resolve(&self.config.location, name)
    }

    fn encode_name(&self, name: &str) -> String {
        self.config.file_name_charset.encode(name)
    }

    fn key_for(&self, name: &str) -> Result<String> {
        Ok(self.encode_name(&self.normalize(name)?))
    }

    /// Write parameters for a normalized name
    pub fn write_parameters(&self, name: &str, content_type: Option<&str>) -> WriteParams {
        WriteParams::compute(
            name,
            content_type,
            self.config.default_acl.as_deref(),
            &self.config.object_parameters,
        )
    }

    async fn load_entries(&self) -> Result<()> {
        self.entries
            .ensure_loaded(|| self.backend.list(&self.config.location))
            .await
    }

    /// Upload `content` in one transfer, returning the cleaned name.
    pub async fn save<R>(&self, name: &str, content: &mut Content<R>) -> Result<String>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let cleaned_name = naming::clean_name(name);
        let normalized = naming::normalize_name(&self.config.location, &[&cleaned_name])?;
        let params = self.write_parameters(&normalized, content.content_type());
        let key = self.encode_name(&normalized);

        let data = content.read_all().await?;
        let size = data.len() as u64;
        self.backend.put(&key, data, &params).await?;

        tracing::debug!(%key, size, content_type = %params.content_type, "Saved media object");

        if self.entries.is_enabled() {
            self.entries
                .upsert(ObjectMeta {
                    key,
                    size,
                    e_tag: None,
                    last_modified: Some(Utc::now()),
                    content_type: Some(params.content_type.clone()),
                })
                .await;
        }

        Ok(cleaned_name)
    }

    /// Open `name` with a mode string such as `"rb"` or `"w"`.
    pub async fn open(&self, name: &str, mode: &str) -> Result<MediaFile> {
        let mode: OpenMode = mode.parse()?;
        match mode.access {
            Access::Read => Ok(MediaFile::Read(self.open_reader(name, mode.binary).await?)),
            Access::Write => Ok(MediaFile::Write(self.open_write(name)?)),
        }
    }

    /// Open for binary reading. Fails with `NotFound` when the object is absent.
    pub async fn open_read(&self, name: &str) -> Result<MediaReader> {
        self.open_reader(name, true).await
    }

    async fn open_reader(&self, name: &str, binary: bool) -> Result<MediaReader> {
        let normalized = self.normalize(name)?;
        let key = self.encode_name(&normalized);
        let meta = self.backend.head(&key).await?;

        Ok(MediaReader::new(
            self.backend.clone(),
            normalized,
            meta,
            binary,
            self.config.max_memory_size,
        ))
    }

    /// Open for streamed writing. No backend call happens until the first write or close.
    pub fn open_write(&self, name: &str) -> Result<MediaWriter> {
        let normalized = self.normalize(name)?;
        let key = self.encode_name(&normalized);
        let params = self.write_parameters(&key, None);

        Ok(MediaWriter::new(
            self.backend.clone(),
            self.entries.clone(),
            normalized,
            key,
            params,
            self.config.file_buffer_size,
            self.config.max_memory_size,
        ))
    }

    /// Delete `name`. Deleting an absent object is not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let key = self.key_for(name)?;
        self.backend.delete(&key).await?;
        self.entries.evict(&key).await;
        tracing::debug!(%key, "Deleted media object");
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let key = self.key_for(name)?;
        self.load_entries().await?;

        match self.entries.lookup(&key).await {
            Lookup::Hit(_) => Ok(true),
            Lookup::Miss => Ok(false),
            Lookup::Unpopulated => self.backend.exists(&key).await,
        }
    }

    /// Size in bytes. A name missing from a populated cache reports 0.
    pub async fn size(&self, name: &str) -> Result<u64> {
        let key = self.key_for(name)?;
        self.load_entries().await?;

        match self.entries.lookup(&key).await {
            Lookup::Hit(meta) => Ok(meta.size),
            Lookup::Miss => Ok(0),
            Lookup::Unpopulated => Ok(self.backend.head(&key).await?.size),
        }
    }

    /// Immediate children of `name` as `(directories, files)`, relative to it.
    pub async fn listdir(&self, name: &str) -> Result<(Vec<String>, Vec<String>)> {
        let mut path = self.key_for(name)?;
        if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }

        let listing = self.backend.list_delimited(&path, "/").await?;

        let relative = |entry: &str| {
            entry
                .strip_prefix(path.as_str())
                .unwrap_or(entry)
                .trim_end_matches('/')
                .to_string()
        };

        let directories = listing.prefixes.iter().map(|p| relative(p)).collect();
        let files = listing
            .keys
            .iter()
            .filter(|key| **key != path)
            .map(|key| relative(key))
            .collect();

        Ok((directories, files))
    }

    /// Public URL through the custom domain, else a presigned URL valid for `expire`.
    pub async fn url(&self, name: &str, parameters: Option<&PresignParams>) -> Result<String> {
        let normalized = self.normalize(name)?;

        if let Some(domain) = &self.config.custom_domain {
            return Ok(format!(
                "https://{}/{}",
                domain,
                naming::filepath_to_uri(&normalized)
            ));
        }

        let key = self.encode_name(&normalized);
        let default_params = PresignParams::default();
        self.backend
            .presign_get(&key, self.config.expire, parameters.unwrap_or(&default_params))
            .await
    }

    /// Name to store `name` under.
    ///
    /// With overwriting enabled the cleaned name is kept (stem-truncated to
    /// `max_length`). Otherwise a random suffix is appended until the name is free.
    pub async fn get_available_name(&self, name: &str, max_length: Option<usize>) -> Result<String> {
        let name = naming::clean_name(name);
        if self.config.file_overwrite {
            return naming::get_available_overwrite_name(&name, max_length);
        }
        self.find_free_name(&name, max_length).await
    }

    async fn find_free_name(&self, name: &str, max_length: Option<usize>) -> Result<String> {
        let (dir_name, file_name) = naming::split(name);
        if dir_name.split('/').any(|part| part == "..") {
            return Err(Error::OutsideBasePath(name.to_string()));
        }
        let (file_root, file_ext) = naming::splitext(file_name);
        let mut file_root = file_root.to_string();
        let mut candidate = name.to_string();

        let too_long = |n: &str| max_length.is_some_and(|max| n.chars().count() > max);

        while too_long(&candidate) || self.exists(&candidate).await? {
            candidate = naming::join(dir_name, &naming::alternative_name(&file_root, file_ext));

            let Some(max) = max_length else {
                continue;
            };
            let length = candidate.chars().count();
            if length > max {
                let truncation = length - max;
                let root_len = file_root.chars().count();
                if truncation >= root_len {
                    return Err(Error::TruncationExhausted(candidate));
                }
                file_root = file_root.chars().take(root_len - truncation).collect();
                candidate =
                    naming::join(dir_name, &naming::alternative_name(&file_root, file_ext));
            }
        }

        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    fn storage_with(temp_dir: &TempDir, config: MediaConfig) -> MediaStorage {
        let backend = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        MediaStorage::new(backend, config)
    }

    #[tokio::test]
    async fn test_save_returns_cleaned_name() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(&temp_dir, MediaConfig::default());

        let mut content = Content::from_bytes("hello");
        let stored = storage.save("a/../b.txt", &mut content).await.unwrap();
        assert_eq!(stored, "b.txt");
        assert_eq!(storage.size("b.txt").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_save_rewinds_content() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(&temp_dir, MediaConfig::default());

        let mut cursor = Cursor::new(b"course intro".to_vec());
        cursor.set_position(7);
        let mut content = Content::new(cursor);
        storage.save("intro.txt", &mut content).await.unwrap();

        let mut reader = storage.open_read("intro.txt").await.unwrap();
        assert_eq!(&reader.read(None).await.unwrap()[..], b"course intro");
    }

    #[tokio::test]
    async fn test_location_prefixes_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(
            &temp_dir,
            MediaConfig {
                location: "media".to_string(),
                ..Default::default()
            },
        );

        let mut content = Content::from_bytes("x");
        storage.save("img.jpg", &mut content).await.unwrap();
        assert!(temp_dir.path().join("media/img.jpg").exists());

        let err = storage.save("../escape.txt", &mut content).await.unwrap_err();
        assert!(matches!(err, Error::OutsideBasePath(_)));
    }

    #[tokio::test]
    async fn test_custom_domain_url() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(
            &temp_dir,
            MediaConfig {
                custom_domain: Some("cdn.example.com".to_string()),
                ..Default::default()
            },
        );

        assert_eq!(
            storage.url("img.jpg", None).await.unwrap(),
            "https://cdn.example.com/img.jpg"
        );
        assert_eq!(
            storage.url("week 1/slides.pdf", None).await.unwrap(),
            "https://cdn.example.com/week%201/slides.pdf"
        );
    }

    #[tokio::test]
    async fn test_presigned_url_unsupported_on_local_backend() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(&temp_dir, MediaConfig::default());

        let err = storage.url("img.jpg", None).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_available_name_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(&temp_dir, MediaConfig::default());

        let mut content = Content::from_bytes("x");
        storage.save("photo.png", &mut content).await.unwrap();
        assert_eq!(
            storage.get_available_name("photo.png", None).await.unwrap(),
            "photo.png"
        );
        assert_eq!(
            storage.get_available_name("dir\\photo.png", Some(9)).await.unwrap(),
            "dir/p.png"
        );
    }

    #[tokio::test]
    async fn test_available_name_without_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage_with(
            &temp_dir,
            MediaConfig {
                file_overwrite: false,
                ..Default::default()
            },
        );

        assert_eq!(
            storage.get_available_name("photo.png", None).await.unwrap(),
            "photo.png"
        );

        let mut content = Content::from_bytes("x");
        storage.save("photo.png", &mut content).await.unwrap();

        let alternative = storage.get_available_name("photo.png", None).await.unwrap();
        assert_ne!(alternative, "photo.png");
        assert!(alternative.starts_with("photo_"));
        assert!(alternative.ends_with(".png"));

        let bounded = storage.get_available_name("photo.png", Some(14)).await.unwrap();
        assert_eq!(bounded.chars().count(), 14);
        assert!(bounded.starts_with("ph_"));

        let err = storage.get_available_name("photo.png", Some(12)).await.unwrap_err();
        assert!(matches!(err, Error::TruncationExhausted(_)));
    }
}
