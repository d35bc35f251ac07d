//! Streamed media file handles
//!
//! A handle is bound to one backend object and is either a [`MediaReader`] or a
//! [`MediaWriter`]; read calls on a writer (and the reverse) do not type-check.
//! `close` consumes the handle, so a handle is terminated exactly once.
//!
//! Writers buffer bytes in a [`SpooledBuffer`] and upload them as multipart
//! segments. The flush threshold is checked before new bytes are absorbed, so a
//! single large write sits in the buffer until the next write or `close`.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use crate::cache::EntryCache;
use crate::media::params::WriteParams;
use crate::storage::spool::SpooledBuffer;
use crate::storage::{CompletedPart, ObjectBackend, ObjectMeta};
use crate::{Error, Result};

/// Default multipart flush threshold, also the S3 minimum part size
pub const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Parsed open mode such as `"rb"` or `"w"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: Access,
    pub binary: bool,
}

impl OpenMode {
    pub const READ_BINARY: OpenMode = OpenMode {
        access: Access::Read,
        binary: true,
    };
    pub const WRITE_BINARY: OpenMode = OpenMode {
        access: Access::Write,
        binary: true,
    };
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        if let Some(c) = mode.chars().find(|c| !matches!(c, 'r' | 'w' | 'b' | 't')) {
            return Err(Error::InvalidMode(format!("unsupported character '{c}' in mode '{mode}'")));
        }

        let binary = mode.contains('b');
        if binary && mode.contains('t') {
            return Err(Error::InvalidMode(format!("can't combine 'b' and 't' in mode '{mode}'")));
        }

        match (mode.contains('r'), mode.contains('w')) {
            (true, true) => Err(Error::InvalidMode("Can't combine 'r' and 'w' in mode.".to_string())),
            (true, false) => Ok(OpenMode {
                access: Access::Read,
                binary,
            }),
            (false, true) => Ok(OpenMode {
                access: Access::Write,
                binary,
            }),
            (false, false) => Err(Error::InvalidMode(format!(
                "mode '{mode}' must contain 'r' or 'w'"
            ))),
        }
    }
}

/// A handle returned by a mode-string open
pub enum MediaFile {
    Read(MediaReader),
    Write(MediaWriter),
}

impl MediaFile {
    pub fn name(&self) -> &str {
        match self {
            MediaFile::Read(r) => r.name(),
            MediaFile::Write(w) => w.name(),
        }
    }

    pub fn into_reader(self) -> Result<MediaReader> {
        match self {
            MediaFile::Read(r) => Ok(r),
            MediaFile::Write(w) => Err(Error::InvalidMode(format!(
                "File was not opened in read mode: {}",
                w.name()
            ))),
        }
    }

    pub fn into_writer(self) -> Result<MediaWriter> {
        match self {
            MediaFile::Write(w) => Ok(w),
            MediaFile::Read(r) => Err(Error::InvalidMode(format!(
                "File was not opened in write mode: {}",
                r.name()
            ))),
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            MediaFile::Read(r) => r.close().await,
            MediaFile::Write(w) => w.close().await,
        }
    }
}

/// Read handle; the object body is downloaded on first read
pub struct MediaReader {
    backend: Arc<dyn ObjectBackend>,
    name: String,
    meta: ObjectMeta,
    binary: bool,
    max_memory: usize,
    buffer: Option<SpooledBuffer>,
}

impl MediaReader {
    pub(crate) fn new(
        backend: Arc<dyn ObjectBackend>,
        name: String,
        meta: ObjectMeta,
        binary: bool,
        max_memory: usize,
    ) -> Self {
        Self {
            backend,
            name,
            meta,
            binary,
            max_memory,
            buffer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.meta.key
    }

    /// Content length reported by the backend when the handle was opened
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Content type stored with the object, when the backend reports one
    pub fn content_type(&self) -> Option<&str> {
        self.meta.content_type.as_deref()
    }

    fn require_binary(&self, binary: bool) -> Result<()> {
        match (self.binary, binary) {
            (true, false) => Err(Error::InvalidMode(format!(
                "File was opened in binary mode, text reads are not allowed: {}",
                self.name
            ))),
            (false, true) => Err(Error::InvalidMode(format!(
                "File was opened in text mode, byte reads are not allowed: {}",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    async fn buffer(&mut self) -> Result<&mut SpooledBuffer> {
        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => {
                let data = self.backend.get(&self.meta.key).await?;
                let mut buffer = SpooledBuffer::new(self.max_memory);
                buffer.append(&data).await?;
                tracing::debug!(key = %self.meta.key, bytes = data.len(), "Downloaded object for reading");
                buffer
            }
        };
        Ok(self.buffer.insert(buffer))
    }

    /// Read up to `n` bytes, or the rest of the object. Binary handles only.
    pub async fn read(&mut self, n: Option<usize>) -> Result<Bytes> {
        self.require_binary(true)?;
        self.buffer().await?.read(n).await
    }

    pub async fn read_line(&mut self) -> Result<Bytes> {
        self.require_binary(true)?;
        self.buffer().await?.read_line().await
    }

    /// Read the rest of the object as UTF-8 text. Text handles only.
    pub async fn read_text(&mut self) -> Result<String> {
        self.require_binary(false)?;
        let data = self.buffer().await?.read(None).await?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    pub async fn read_line_text(&mut self) -> Result<String> {
        self.require_binary(false)?;
        let data = self.buffer().await?.read_line().await?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    pub async fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Write handle streaming into a multipart upload
pub struct MediaWriter {
    backend: Arc<dyn ObjectBackend>,
    entries: Arc<EntryCache>,
    name: String,
    key: String,
    params: WriteParams,
    buffer_size: usize,
    buffer: SpooledBuffer,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    part_counter: i32,
    dirty: bool,
    raw_bytes_written: u64,
    closed: bool,
}

impl MediaWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn ObjectBackend>,
        entries: Arc<EntryCache>,
        name: String,
        key: String,
        params: WriteParams,
        buffer_size: usize,
        max_memory: usize,
    ) -> Self {
        Self {
            backend,
            entries,
            name,
            key,
            params,
            buffer_size,
            buffer: SpooledBuffer::new(max_memory),
            upload_id: None,
            parts: Vec::new(),
            part_counter: 0,
            dirty: false,
            raw_bytes_written: 0,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bytes_written(&self) -> u64 {
        self.raw_bytes_written
    }

    /// Bytes buffered locally and not yet uploaded
    pub fn buffered(&self) -> u64 {
        self.buffer.len()
    }

    /// Segments uploaded so far
    pub fn parts_uploaded(&self) -> usize {
        self.parts.len()
    }

    pub async fn write(&mut self, content: impl AsRef<[u8]>) -> Result<usize> {
        let content = content.as_ref();
        self.dirty = true;

        if self.upload_id.is_none() {
            let upload_id = self.backend.create_multipart(&self.key, &self.params).await?;
            self.upload_id = Some(upload_id);
        }

        if self.buffer.len() >= self.buffer_size as u64 {
            self.flush_write_buffer().await?;
        }

        self.raw_bytes_written += content.len() as u64;
        self.buffer.append(content).await?;
        Ok(content.len())
    }

    async fn flush_write_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let upload_id = self
            .upload_id
            .clone()
            .ok_or_else(|| Error::internal("write buffer flushed without a multipart upload"))?;

        let part_number = self.part_counter + 1;
        let data = self.buffer.contents().await?;
        let e_tag = self
            .backend
            .upload_part(&self.key, &upload_id, part_number, data)
            .await?;

        self.part_counter = part_number;
        self.parts.push(CompletedPart { part_number, e_tag });
        self.buffer.clear().await?;
        Ok(())
    }

    /// Finish the object: complete, abort, or create it empty.
    ///
    /// A failed close aborts the multipart upload if one is still open.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.finish().await;
        if result.is_err() {
            if let Some(upload_id) = self.upload_id.take() {
                if let Err(e) = self.backend.abort_multipart(&self.key, &upload_id).await {
                    tracing::warn!(key = %self.key, %upload_id, error = %e, "Failed to abort multipart upload");
                }
            }
        }
        result
    }

    /// Discard everything written so far without creating the object.
    pub async fn abort(mut self) -> Result<()> {
        self.closed = true;
        if let Some(upload_id) = self.upload_id.take() {
            self.backend.abort_multipart(&self.key, &upload_id).await?;
            tracing::debug!(
                key = %self.key,
                %upload_id,
                bytes = self.raw_bytes_written,
                "Multipart upload aborted"
            );
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.dirty {
            self.flush_write_buffer().await?;
            let upload_id = self
                .upload_id
                .clone()
                .ok_or_else(|| Error::internal("dirty writer without a multipart upload"))?;

            if self.parts.is_empty() {
                // only empty writes happened; there is nothing to complete
                self.backend.abort_multipart(&self.key, &upload_id).await?;
                self.upload_id = None;
                return self.create_empty_on_close().await;
            }

            self.backend
                .complete_multipart(&self.key, &upload_id, &self.parts)
                .await?;
            self.upload_id = None;
            tracing::info!(
                key = %self.key,
                parts = self.parts.len(),
                bytes = self.raw_bytes_written,
                "Multipart upload completed"
            );

            self.entries
                .upsert(ObjectMeta {
                    key: self.key.clone(),
                    size: self.raw_bytes_written,
                    e_tag: None,
                    last_modified: Some(Utc::now()),
                    content_type: Some(self.params.content_type.clone()),
                })
                .await;
            return Ok(());
        }

        if let Some(upload_id) = self.upload_id.take() {
            self.backend.abort_multipart(&self.key, &upload_id).await?;
        }
        if self.raw_bytes_written == 0 {
            self.create_empty_on_close().await?;
        }
        Ok(())
    }

    /// Mirror filesystem semantics: opening for write and closing leaves an
    /// empty object, unless one already exists.
    async fn create_empty_on_close(&self) -> Result<()> {
        match self.backend.head(&self.key).await {
            Ok(_) => return Ok(()),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // conditional: a concurrent creator between the probe and here wins
        let created = self
            .backend
            .put_if_absent(&self.key, Bytes::new(), &self.params)
            .await?;
        if created {
            tracing::debug!(key = %self.key, "Created empty object on close");
            self.entries
                .upsert(ObjectMeta {
                    key: self.key.clone(),
                    size: 0,
                    e_tag: None,
                    last_modified: Some(Utc::now()),
                    content_type: Some(self.params.content_type.clone()),
                })
                .await;
        }
        Ok(())
    }
}

impl Drop for MediaWriter {
    fn drop(&mut self) {
        if !self.closed && self.dirty {
            tracing::warn!(
                key = %self.key,
                upload_id = self.upload_id.as_deref().unwrap_or_default(),
                "Media writer dropped without close; multipart upload left incomplete"
            );
        }
    }
}
