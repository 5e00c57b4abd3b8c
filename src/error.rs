//! Connection-level error taxonomy.
//!
//! Every variant terminates the connection it was raised on. Parse-level variants
//! map to a best-effort status code via [`ConnectionError::status`]; transport-level
//! variants close silently.

use thiserror::Error;

use crate::http::StatusCode;

/// Errors that terminate a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("header line exceeds maximum size of {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("request carries more than {limit} headers")]
    TooManyHeaders { limit: usize },

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("content exceeds maximum length of {limit} bytes")]
    ContentTooLarge { limit: u64 },

    #[error("chunked decode error: {0}")]
    ChunkedDecode(String),

    #[error("invalid form segment: {0}")]
    MultipartFormat(String),

    #[error("gzip decode error: {0}")]
    GzipDecode(#[source] std::io::Error),

    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("socket I/O error: {0}")]
    SocketIo(#[from] std::io::Error),

    #[error("request id space exhausted")]
    RequestIdExhausted,

    #[error("connection idle timeout")]
    IdleTimeout,
}

impl ConnectionError {
    /// Returns the status of the best-effort error response to flush before
    /// closing, or `None` when the connection closes without a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::MalformedRequestLine(_)
            | Self::InvalidContentLength(_)
            | Self::ChunkedDecode(_)
            | Self::MultipartFormat(_)
            | Self::GzipDecode(_) => Some(StatusCode::BadRequest),
            Self::HeaderTooLarge { .. } | Self::TooManyHeaders { .. } => {
                Some(StatusCode::RequestHeaderFieldsTooLarge)
            }
            Self::ContentTooLarge { .. } => Some(StatusCode::PayloadTooLarge),
            Self::UnsupportedTransferEncoding(_) => Some(StatusCode::NotImplemented),
            Self::SocketIo(_) | Self::RequestIdExhausted | Self::IdleTimeout => None,
        }
    }
}
