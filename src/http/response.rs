//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing responses. Serialization
//! onto the socket lives in [`crate::codec::encode`], which picks the body
//! framing.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};
use crate::codec::Content;

/// An HTTP/1.1 response, ready to be handed to the response sequencer.
///
/// The `id` ties a response to the request that produced it; the connection
/// stamps it before the response is queued, so handlers never set it.
///
/// # Examples
///
/// ```
/// use pipehttp::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.content_ref().and_then(|c| c.len()), Some(15));
/// assert!(!response.is_close());
/// ```
#[derive(Debug)]
pub struct Response {
    id: u64,
    status: StatusCode,
    headers: Headers,
    content: Option<Content>,
    close: bool,
}

impl Response {
    /// Creates a new response with the given status and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            id: 0,
            status,
            headers: Headers::new(),
            content: None,
            close: false,
        }
    }

    /// A plain-text error response. `detail` replaces the reason phrase as
    /// the body when given.
    pub fn error(status: StatusCode, detail: Option<&str>) -> Self {
        Self::new(status).body(detail.unwrap_or(status.canonical_reason()).to_owned())
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a UTF-8 text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.content = Some(Content::text(body));
        self
    }

    /// Sets a raw `application/octet-stream` body.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.content = Some(Content::bytes("application/octet-stream", body.into()));
        self
    }

    /// Sets the body content, including its coding flags.
    #[must_use]
    pub fn content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    /// `keep_alive(false)` is the same as [`close`](Self::close).
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.close = !keep_alive;
        self
    }

    /// Drops the connection once this response is written; later responses
    /// on the same connection are discarded.
    #[must_use]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Tags the response with the id of its originating request.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_ref(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub(crate) fn into_parts(self) -> (StatusCode, Headers, Option<Content>, bool) {
        (self.status, self.headers, self.content, self.close)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Serializes the status line and header block, blank line included.
pub(crate) fn head_bytes(status: StatusCode, headers: &Headers) -> BytesMut {
    let rendered = headers.to_string();
    let mut buf = BytesMut::with_capacity(32 + rendered.len());
    buf.put(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason()
        )
        .as_bytes(),
    );
    buf.put(rendered.as_bytes());
    buf.put(&b"\r\n"[..]);
    buf
}
