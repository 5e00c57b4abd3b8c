//! Connection reader: turns a byte stream into a sequence of [`Request`]s.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::debug;

use crate::codec::{LineReader, read_body};
use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::http::Request;
use crate::http::request::RequestHead;

/// Per-connection request id counter.
///
/// Ids start at 0 and are never reused. The counter refuses to hand out
/// `max` itself; the request that takes `max - 1` is the last one.
#[derive(Debug, Clone)]
pub struct RequestIds {
    next: u64,
    max: u64,
}

impl RequestIds {
    pub fn new(max: u64) -> Self {
        Self { next: 0, max }
    }

    /// Assigns the next id. The flag is `true` when no id remains after it.
    pub fn assign(&mut self) -> Result<(u64, bool), ConnectionError> {
        if self.next >= self.max {
            return Err(ConnectionError::RequestIdExhausted);
        }
        let id = self.next;
        self.next += 1;
        Ok((id, self.next >= self.max))
    }

    /// The id the next request would receive, if any remain.
    pub fn peek(&self) -> Option<u64> {
        (self.next < self.max).then_some(self.next)
    }
}

/// Reads requests off one connection, header block first, then any body.
pub struct ConnectionReader<R> {
    lines: LineReader<R>,
    config: Arc<ServerConfig>,
    ids: RequestIds,
    // Id assigned to a request whose body is still being decoded.
    in_flight: Option<u64>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(reader: R, config: Arc<ServerConfig>) -> Self {
        Self {
            lines: LineReader::new(reader, config.max_header_size, config.idle_timeout()),
            ids: RequestIds::new(config.max_requests_per_connection),
            config,
            in_flight: None,
        }
    }

    /// Reads the next complete request.
    ///
    /// Returns `Ok(None)` when the peer closes the connection between
    /// requests. Any error leaves the reader unusable; the caller drops the
    /// connection.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ConnectionError> {
        let Some(block) = self.read_head_block().await? else {
            return Ok(None);
        };
        let head = RequestHead::parse(&block, self.config.max_headers)?;

        let (id, last) = self.ids.assign()?;
        self.in_flight = Some(id);
        if last {
            debug!(id, "request id space exhausted; closing after this request");
        }

        let mut request = Request::new(id, head);
        if last {
            request = request.close_after();
        }
        let body = read_body(&mut self.lines, request.headers(), &self.config).await?;
        if let Some(body) = body {
            request = request.with_body(body);
        }

        self.in_flight = None;
        Ok(Some(request))
    }

    /// The id a best-effort error response should carry: the request being
    /// decoded, or else the next unassigned id.
    pub fn error_response_id(&self) -> Option<u64> {
        self.in_flight.or_else(|| self.ids.peek())
    }

    // Collects the request line and header lines up to the blank line,
    // re-terminating each line with CRLF for the head parser.
    async fn read_head_block(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let max_headers = self.config.max_headers;

        // Blank lines ahead of the request line are skipped.
        let request_line = loop {
            match self.lines.read_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        reject_bare_line_breaks(&request_line)?;

        let mut block = request_line;
        block.extend_from_slice(b"\r\n");
        let mut count = 0usize;
        loop {
            let line = self.lines.read_line().await?.ok_or_else(|| {
                ConnectionError::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside header block",
                ))
            })?;
            if line.is_empty() {
                block.extend_from_slice(b"\r\n");
                return Ok(Some(block));
            }
            count += 1;
            if count > max_headers {
                return Err(ConnectionError::TooManyHeaders { limit: max_headers });
            }
            reject_bare_line_breaks(&line)?;
            block.extend_from_slice(&line);
            block.extend_from_slice(b"\r\n");
        }
    }
}

// Lines end only at CRLF. A stray CR or LF inside a line would let the head
// parser see a different line structure than this reader did.
fn reject_bare_line_breaks(line: &[u8]) -> Result<(), ConnectionError> {
    if line.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Err(ConnectionError::MalformedRequestLine(
            "bare CR or LF inside a header line".into(),
        ));
    }
    Ok(())
}
