//! Bounded CRLF line extraction over a buffered socket read half.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

use crate::error::ConnectionError;

const CRLF: [u8; 2] = *b"\r\n";

/// Reads CRLF-terminated lines and exact byte counts from a stream.
///
/// Every wait on the underlying reader is bounded by the idle timeout. Bytes
/// past the current line stay buffered for the next call, so pipelined
/// requests are never lost.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line: usize,
    idle_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_line,
            idle_timeout,
        }
    }

    /// Reads one line, without its terminator.
    ///
    /// A line ends when the last two bytes seen equal CRLF. Returns `Ok(None)`
    /// when the stream ends cleanly before the first byte of a line. A line
    /// longer than the configured maximum fails with
    /// [`ConnectionError::HeaderTooLarge`] whatever its content.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let max_line = self.max_line;
        let mut line = Vec::new();
        let mut window = [0u8; 2];

        loop {
            let available = match timeout(self.idle_timeout, self.inner.fill_buf()).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectionError::IdleTimeout),
            };

            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-line",
                )));
            }

            let mut used = 0;
            let mut complete = false;
            for &byte in available {
                used += 1;
                window = [window[1], byte];
                line.push(byte);
                if window == CRLF {
                    complete = true;
                    break;
                }
                // One trailing CR may still be the start of the terminator.
                if line.len() > max_line + 1 {
                    return Err(ConnectionError::HeaderTooLarge { limit: max_line });
                }
            }
            self.inner.consume(used);

            if complete {
                line.truncate(line.len() - CRLF.len());
                if line.len() > max_line {
                    return Err(ConnectionError::HeaderTooLarge { limit: max_line });
                }
                return Ok(Some(line));
            }
        }
    }

    /// Fills `buf` completely; a short read is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        match timeout(self.idle_timeout, self.inner.read_exact(buf)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(ConnectionError::IdleTimeout),
        }
    }

    /// Consumes the CRLF that must follow a chunk's data.
    pub(crate) async fn expect_crlf(&mut self) -> Result<bool, ConnectionError> {
        let mut terminator = [0u8; 2];
        self.read_exact(&mut terminator).await?;
        Ok(terminator == CRLF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(input: &[u8], max_line: usize) -> LineReader<&[u8]> {
        LineReader::new(input, max_line, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn splits_on_crlf_only() {
        let mut lines = reader(b"GET / HTTP/1.1\r\nA: b\nc\r\n\r\n", 64);
        assert_eq!(lines.read_line().await.unwrap().unwrap(), b"GET / HTTP/1.1");
        assert_eq!(lines.read_line().await.unwrap().unwrap(), b"A: b\nc");
        assert_eq!(lines.read_line().await.unwrap().unwrap(), b"");
        assert!(lines.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted() {
        let input = [vec![b'x'; 16], b"\r\n".to_vec()].concat();
        let mut lines = reader(&input, 16);
        assert_eq!(lines.read_line().await.unwrap().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn line_over_limit_is_rejected_whatever_its_content() {
        for fill in [b'x', b'\r', b':', b' '] {
            let input = [vec![fill; 17], b"\r\n".to_vec()].concat();
            let mut lines = reader(&input, 16);
            assert!(matches!(
                lines.read_line().await,
                Err(ConnectionError::HeaderTooLarge { limit: 16 })
            ));
        }
    }

    #[tokio::test]
    async fn unterminated_line_is_rejected_without_waiting_for_crlf() {
        let input = vec![b'y'; 64];
        let mut lines = reader(&input, 16);
        assert!(matches!(
            lines.read_line().await,
            Err(ConnectionError::HeaderTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn eof_mid_line_is_io_error() {
        let mut lines = reader(b"partial", 64);
        assert!(matches!(
            lines.read_line().await,
            Err(ConnectionError::SocketIo(_))
        ));
    }

    #[tokio::test]
    async fn read_exact_short_read_fails() {
        let mut lines = reader(b"abc", 64);
        let mut buf = [0u8; 4];
        assert!(matches!(
            lines.read_exact(&mut buf).await,
            Err(ConnectionError::SocketIo(_))
        ));
    }

    #[tokio::test]
    async fn idle_reader_times_out() {
        let (client, server) = tokio::io::duplex(64);
        let mut lines = LineReader::new(server, 64, Duration::from_millis(20));
        assert!(matches!(
            lines.read_line().await,
            Err(ConnectionError::IdleTimeout)
        ));
        drop(client);
    }
}
