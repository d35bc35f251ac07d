//! Spooled byte buffer
//!
//! Keeps data in memory until it would grow past `max_memory` bytes, then moves
//! it to an anonymous temporary file. A `max_memory` of 0 never spills.

use std::io::SeekFrom;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::Result;

const LINE_CHUNK: usize = 8 * 1024;

enum Spool {
    Memory(Vec<u8>),
    Disk(File),
}

pub struct SpooledBuffer {
    max_memory: usize,
    inner: Spool,
    len: u64,
    /// Read cursor
    pos: u64,
}

impl SpooledBuffer {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            inner: Spool::Memory(Vec::new()),
            len: 0,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, Spool::Disk(_))
    }

    /// Append bytes at the end of the buffer
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        if let Spool::Memory(buf) = &mut self.inner {
            if self.max_memory == 0 || buf.len() + data.len() <= self.max_memory {
                buf.extend_from_slice(data);
                self.len += data.len() as u64;
                return Ok(());
            }
            self.rollover().await?;
        }

        if let Spool::Disk(file) = &mut self.inner {
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(data).await?;
            file.flush().await?;
        }
        self.len += data.len() as u64;
        Ok(())
    }

    async fn rollover(&mut self) -> Result<()> {
        let buf = match &mut self.inner {
            Spool::Memory(buf) => std::mem::take(buf),
            Spool::Disk(_) => return Ok(()),
        };

        let mut file = File::from_std(tempfile::tempfile()?);
        file.write_all(&buf).await?;
        file.flush().await?;
        self.inner = Spool::Disk(file);

        tracing::debug!(
            bytes = buf.len(),
            max_memory = self.max_memory,
            "Spooled buffer moved to temporary file"
        );
        Ok(())
    }

    /// Copy of the whole contents, cursor untouched.
    pub async fn contents(&mut self) -> Result<Bytes> {
        self.read_at(0, self.len as usize).await
    }

    /// Drop the contents. A spilled buffer keeps its (now empty) file.
    pub async fn clear(&mut self) -> Result<()> {
        match &mut self.inner {
            Spool::Memory(buf) => buf.clear(),
            Spool::Disk(file) => file.set_len(0).await?,
        }
        self.len = 0;
        self.pos = 0;
        Ok(())
    }

    /// Remove and return the whole contents, leaving the buffer empty.
    pub async fn take(&mut self) -> Result<Bytes> {
        let data = self.contents().await?;
        self.clear().await?;
        Ok(data)
    }

    /// Move the read cursor to the start
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Read up to `max` bytes from the cursor, or everything left when `None`.
    pub async fn read(&mut self, max: Option<usize>) -> Result<Bytes> {
        let remaining = self.len.saturating_sub(self.pos) as usize;
        let n = max.map_or(remaining, |max| max.min(remaining));
        let data = self.read_at(self.pos, n).await?;
        self.pos += n as u64;
        Ok(data)
    }

    /// Read through the next `\n` (inclusive) or to the end.
    pub async fn read_line(&mut self) -> Result<Bytes> {
        let line = match &mut self.inner {
            Spool::Memory(buf) => {
                let start = self.pos as usize;
                let rest = &buf[start.min(buf.len())..];
                let end = rest
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(rest.len(), |idx| idx + 1);
                Bytes::copy_from_slice(&rest[..end])
            }
            Spool::Disk(file) => {
                file.seek(SeekFrom::Start(self.pos)).await?;
                let mut line = Vec::new();
                let mut chunk = vec![0u8; LINE_CHUNK];
                loop {
                    let read = file.read(&mut chunk).await?;
                    if read == 0 {
                        break;
                    }
                    if let Some(idx) = chunk[..read].iter().position(|b| *b == b'\n') {
                        line.extend_from_slice(&chunk[..=idx]);
                        break;
                    }
                    line.extend_from_slice(&chunk[..read]);
                }
                Bytes::from(line)
            }
        };
        self.pos += line.len() as u64;
        Ok(line)
    }

    async fn read_at(&mut self, pos: u64, n: usize) -> Result<Bytes> {
        match &mut self.inner {
            Spool::Memory(buf) => {
                let start = pos as usize;
                Ok(Bytes::copy_from_slice(&buf[start..start + n]))
            }
            Spool::Disk(file) => {
                let mut out = vec![0u8; n];
                file.seek(SeekFrom::Start(pos)).await?;
                file.read_exact(&mut out).await?;
                Ok(Bytes::from(out))
            }
        }
    }
}
