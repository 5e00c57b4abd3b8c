//! Message body codecs.
//!
//! The read side turns framed wire bytes into a [`Content`]: exact-length and
//! chunked framing, gzip inflation, url-encoded and multipart forms. The write
//! side frames an outgoing [`Content`] with `Content-Length` or chunked transfer
//! coding, optionally deflating it first.
//!
//! Payloads are held in one of three shapes (see [`Payload`]); the decoder picks
//! the shape by size, never by caller intent alone.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

pub mod decode;
pub mod encode;
pub mod form;
pub mod lines;
pub mod spool;

pub use decode::{DecodedBody, read_body};
pub use encode::{EncodeOptions, write_response};
pub use form::{Form, FormPart};
pub use lines::LineReader;
pub use spool::SpooledFile;

/// Boxed byte stream used for live payloads.
pub type ByteStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Where the bytes of a body live.
pub enum Payload {
    /// Held entirely in memory.
    InMemory(Bytes),
    /// Buffered to a temp file, removed when dropped.
    Spooled(SpooledFile),
    /// Produced on demand; length unknown up front.
    Streamed(ByteStream),
}

impl Payload {
    /// Returns the payload length when it is known without reading.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::InMemory(bytes) => Some(bytes.len() as u64),
            Self::Spooled(file) => Some(file.len()),
            Self::Streamed(_) => None,
        }
    }

    /// Returns `true` for a known-empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Converts the payload into a reader over its bytes.
    ///
    /// A spooled file stays on disk until the returned reader drops.
    pub async fn into_reader(self) -> io::Result<ByteStream> {
        Ok(match self {
            Self::InMemory(bytes) => Box::new(io::Cursor::new(bytes)),
            Self::Spooled(file) => Box::new(SpoolReader {
                inner: file.open().await?,
                _file: file,
            }),
            Self::Streamed(stream) => stream,
        })
    }

    /// Reads the whole payload into memory, failing if it exceeds `limit`.
    pub async fn into_bytes(self, limit: u64) -> io::Result<Bytes> {
        if let Self::InMemory(bytes) = self {
            return Ok(bytes);
        }
        let mut reader = self.into_reader().await?.take(limit.saturating_add(1));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        if out.len() as u64 > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload exceeds {limit} bytes"),
            ));
        }
        Ok(Bytes::from(out))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory(bytes) => f.debug_tuple("InMemory").field(&bytes.len()).finish(),
            Self::Spooled(file) => f.debug_tuple("Spooled").field(file).finish(),
            Self::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

// Keeps the spool guard alive for as long as the file is being read.
struct SpoolReader {
    inner: tokio::fs::File,
    _file: SpooledFile,
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// A message body: its type, payload and coding flags.
///
/// On a request the flags record how the body arrived; on a response they ask
/// the encoder for chunked framing and gzip output.
///
/// # Examples
///
/// ```
/// use pipehttp::codec::Content;
///
/// let content = Content::text("hello").gzip();
/// assert_eq!(content.content_type(), "text/plain; charset=utf-8");
/// assert!(content.is_gzip());
/// assert_eq!(content.len(), Some(5));
/// ```
#[derive(Debug)]
pub struct Content {
    content_type: String,
    payload: Payload,
    chunked: bool,
    gzip: bool,
    filename: Option<String>,
}

impl Content {
    pub fn new(content_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            content_type: content_type.into(),
            payload,
            chunked: false,
            gzip: false,
            filename: None,
        }
    }

    /// In-memory content with the given type.
    pub fn bytes(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(content_type, Payload::InMemory(bytes.into()))
    }

    /// UTF-8 plain text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::bytes("text/plain; charset=utf-8", text.into())
    }

    /// A live stream. Streams of unknown length are always sent chunked.
    pub fn stream(content_type: impl Into<String>, stream: ByteStream) -> Self {
        Self::new(content_type, Payload::Streamed(stream))
    }

    /// Requests chunked transfer coding.
    #[must_use]
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    /// Requests gzip content coding.
    #[must_use]
    pub fn gzip(mut self) -> Self {
        self.gzip = true;
        self
    }

    /// Suggests a download filename (`Content-Disposition: attachment`).
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub(crate) fn with_flags(mut self, chunked: bool, gzip: bool) -> Self {
        self.chunked = chunked;
        self.gzip = gzip;
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip
    }

    pub fn suggested_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn len(&self) -> Option<u64> {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the bytes when the payload is held in memory.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::InMemory(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Reads the payload without consuming the content.
    ///
    /// Live streams cannot be re-read and yield [`io::ErrorKind::Unsupported`].
    pub async fn read_bytes(&self) -> io::Result<Bytes> {
        match &self.payload {
            Payload::InMemory(bytes) => Ok(bytes.clone()),
            Payload::Spooled(file) => Ok(Bytes::from(tokio::fs::read(file.path()).await?)),
            Payload::Streamed(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "streamed payloads can only be read once",
            )),
        }
    }
}

/// Lower-cased media type without parameters, e.g. `multipart/form-data`.
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
