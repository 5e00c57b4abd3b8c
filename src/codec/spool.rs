//! Temp-file spooling for bodies too large to keep in memory.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::Payload;

static SPOOL_SEQ: AtomicU64 = AtomicU64::new(0);

/// A body buffered to a temp file. The file is removed when this value drops.
pub struct SpooledFile {
    path: PathBuf,
    len: u64,
}

impl SpooledFile {
    /// Creates a fresh, empty spool file in `dir`.
    pub async fn create(dir: &Path) -> io::Result<(Self, File)> {
        let seq = SPOOL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("pipehttp-{}-{seq}.spool", std::process::id()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok((Self { path, len: 0 }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opens the spool file for reading from the start.
    pub async fn open(&self) -> io::Result<File> {
        File::open(&self.path).await
    }
}

impl fmt::Debug for SpooledFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpooledFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SpooledFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "failed to remove spool file");
        }
    }
}

/// Accumulates body bytes in memory, moving to a spool file once the
/// threshold is crossed.
pub(crate) struct BodySink {
    dir: PathBuf,
    threshold: usize,
    buf: BytesMut,
    spool: Option<(SpooledFile, File)>,
}

impl BodySink {
    pub(crate) fn new(dir: &Path, threshold: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            threshold,
            buf: BytesMut::new(),
            spool: None,
        }
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some((spooled, file)) = self.spool.as_mut() {
            file.write_all(data).await?;
            spooled.len += data.len() as u64;
            return Ok(());
        }

        if self.buf.len() + data.len() <= self.threshold {
            self.buf.extend_from_slice(data);
            return Ok(());
        }

        let (mut spooled, mut file) = SpooledFile::create(&self.dir).await?;
        debug!(path = %spooled.path.display(), "spooling body to disk");
        file.write_all(&self.buf).await?;
        file.write_all(data).await?;
        spooled.len = (self.buf.len() + data.len()) as u64;
        self.buf.clear();
        self.spool = Some((spooled, file));
        Ok(())
    }

    pub(crate) async fn finish(self) -> io::Result<Payload> {
        match self.spool {
            Some((spooled, mut file)) => {
                file.flush().await?;
                Ok(Payload::Spooled(spooled))
            }
            None => Ok(Payload::InMemory(self.buf.freeze())),
        }
    }
}
