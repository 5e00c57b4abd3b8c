//! Request body decoding.
//!
//! [`read_body`] inspects the request headers and runs the matching steps in
//! order: framing (`Content-Length` or chunked), content coding (gzip), then
//! structured decoding of form payloads. Every step is bounded by a configured
//! maximum and fails closed.

use std::io::Write;

use flate2::write::GzDecoder;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::form::{self, Form};
use super::lines::LineReader;
use super::spool::BodySink;
use super::{Content, Payload, media_type};
use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::http::Headers;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const FORM_MULTIPART: &str = "multipart/form-data";

/// A decoded request body and, for form payloads, its parsed fields.
#[derive(Debug)]
pub struct DecodedBody {
    pub content: Content,
    pub form: Option<Form>,
}

// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked,
    Length(u64),
    None,
}

fn framing(headers: &Headers) -> Result<Framing, ConnectionError> {
    if headers.contains("transfer-encoding") {
        let mut chunked = false;
        for coding in headers.get_all("transfer-encoding") {
            let coding = coding.trim();
            if coding.eq_ignore_ascii_case("chunked") {
                chunked = true;
            } else if !coding.eq_ignore_ascii_case("identity") {
                return Err(ConnectionError::UnsupportedTransferEncoding(coding.to_owned()));
            }
        }
        if chunked {
            return Ok(Framing::Chunked);
        }
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("content-length") {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConnectionError::InvalidContentLength(value.to_owned()));
        }
        let parsed = value
            .parse::<u64>()
            .map_err(|_| ConnectionError::InvalidContentLength(value.to_owned()))?;
        if length.is_some_and(|seen| seen != parsed) {
            return Err(ConnectionError::InvalidContentLength(value.to_owned()));
        }
        length = Some(parsed);
    }

    Ok(length.map_or(Framing::None, Framing::Length))
}

/// Reads and decodes the body announced by `headers`, if any.
///
/// Returns `Ok(None)` when the request carries no body and no form content
/// type.
pub async fn read_body<R>(
    lines: &mut LineReader<R>,
    headers: &Headers,
    config: &ServerConfig,
) -> Result<Option<DecodedBody>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let content_type = headers.get("content-type").unwrap_or_default().to_owned();
    let media = media_type(&content_type);
    let is_form = media == FORM_URLENCODED || media == FORM_MULTIPART;

    let (payload, chunked, limit) = match framing(headers)? {
        Framing::Chunked => (
            read_chunked(lines, config).await?,
            true,
            config.max_chunked_length,
        ),
        Framing::Length(len) => (
            read_content_length(lines, len, config).await?,
            false,
            config.max_content_length,
        ),
        Framing::None if is_form => (Payload::InMemory(Default::default()), false, 0),
        Framing::None => return Ok(None),
    };

    let gzip = headers
        .get_all("content-encoding")
        .any(|c| c.trim().eq_ignore_ascii_case("gzip") || c.trim().eq_ignore_ascii_case("x-gzip"));

    let (payload, limit) = if gzip {
        (gunzip(payload, config).await?, config.max_content_length)
    } else {
        (payload, limit)
    };

    if !is_form {
        let content = Content::new(content_type, payload).with_flags(chunked, gzip);
        return Ok(Some(DecodedBody { content, form: None }));
    }

    if payload.len().is_some_and(|len| len > limit) {
        return Err(ConnectionError::ContentTooLarge { limit });
    }
    let bytes = payload.into_bytes(limit).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidData => ConnectionError::ContentTooLarge { limit },
        _ => ConnectionError::SocketIo(e),
    })?;
    let parsed = if media == FORM_MULTIPART {
        let boundary = form::boundary(&content_type).ok_or_else(|| {
            ConnectionError::MultipartFormat("missing boundary parameter".into())
        })?;
        Form::Multipart(form::parse_multipart(&bytes, &boundary)?)
    } else {
        Form::UrlEncoded(form::parse_urlencoded(&String::from_utf8_lossy(&bytes)))
    };

    let content = Content::new(content_type, Payload::InMemory(bytes)).with_flags(chunked, gzip);
    Ok(Some(DecodedBody {
        content,
        form: Some(parsed),
    }))
}

/// Reads exactly `len` bytes.
pub async fn read_content_length<R>(
    lines: &mut LineReader<R>,
    len: u64,
    config: &ServerConfig,
) -> Result<Payload, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    if len > config.max_content_length {
        return Err(ConnectionError::ContentTooLarge {
            limit: config.max_content_length,
        });
    }

    let mut sink = BodySink::new(&config.temp_dir, config.spool_threshold);
    let mut piece = vec![0u8; config.max_chunk_size];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(piece.len() as u64) as usize;
        lines.read_exact(&mut piece[..n]).await?;
        sink.write(&piece[..n]).await?;
        remaining -= n as u64;
    }
    Ok(sink.finish().await?)
}

/// Reads a chunked body up to and including its terminating zero-size chunk
/// and trailer section.
pub async fn read_chunked<R>(
    lines: &mut LineReader<R>,
    config: &ServerConfig,
) -> Result<Payload, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut sink = BodySink::new(&config.temp_dir, config.spool_threshold);
    let mut piece = vec![0u8; config.max_chunk_size];
    let mut total: u64 = 0;

    loop {
        let line = lines
            .read_line()
            .await?
            .ok_or_else(|| ConnectionError::ChunkedDecode("stream ended before last chunk".into()))?;
        let size = parse_chunk_size(&line)?;

        if size == 0 {
            // Trailer fields are read and discarded.
            loop {
                match lines.read_line().await? {
                    Some(trailer) if trailer.is_empty() => break,
                    Some(_) => continue,
                    None => {
                        return Err(ConnectionError::ChunkedDecode(
                            "stream ended inside trailer section".into(),
                        ));
                    }
                }
            }
            break;
        }

        total = total.saturating_add(size);
        if total > config.max_chunked_length {
            return Err(ConnectionError::ContentTooLarge {
                limit: config.max_chunked_length,
            });
        }

        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(piece.len() as u64) as usize;
            lines.read_exact(&mut piece[..n]).await?;
            sink.write(&piece[..n]).await?;
            remaining -= n as u64;
        }

        if !lines.expect_crlf().await? {
            return Err(ConnectionError::ChunkedDecode(
                "chunk data not followed by CRLF".into(),
            ));
        }
    }

    debug!(total, "chunked body decoded");
    Ok(sink.finish().await?)
}

/// Parses a chunk-size line, ignoring chunk extensions.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ConnectionError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ConnectionError::ChunkedDecode("chunk size is not ASCII".into()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConnectionError::ChunkedDecode(format!(
            "invalid chunk size {digits:?}"
        )));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| ConnectionError::ChunkedDecode(format!("chunk size {digits:?} overflows")))
}

/// Inflates a gzip payload. The output replaces the payload and is bounded by
/// `max_content_length`.
pub async fn gunzip(payload: Payload, config: &ServerConfig) -> Result<Payload, ConnectionError> {
    let limit = config.max_content_length;
    let mut reader = payload.into_reader().await?;
    let mut decoder = GzDecoder::new(Vec::new());
    let mut sink = BodySink::new(&config.temp_dir, config.spool_threshold);
    let mut piece = vec![0u8; config.max_chunk_size];
    let mut produced: u64 = 0;

    loop {
        let n = reader.read(&mut piece).await?;
        if n == 0 {
            decoder.try_finish().map_err(ConnectionError::GzipDecode)?;
        } else {
            decoder
                .write_all(&piece[..n])
                .map_err(ConnectionError::GzipDecode)?;
        }

        let inflated = std::mem::take(decoder.get_mut());
        produced += inflated.len() as u64;
        if produced > limit {
            return Err(ConnectionError::ContentTooLarge { limit });
        }
        sink.write(&inflated).await?;

        if n == 0 {
            break;
        }
    }

    Ok(sink.finish().await?)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::time::Duration;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            max_chunk_size: 4,
            max_chunked_length: 64,
            max_content_length: 64,
            ..ServerConfig::default()
        }
    }

    fn lines(input: &[u8]) -> LineReader<&[u8]> {
        LineReader::new(input, 128, Duration::from_secs(5))
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert_raw(name, value);
        }
        headers
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn in_memory(payload: Payload) -> Vec<u8> {
        payload.into_bytes(u64::MAX - 1).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn content_length_reads_exact_bytes() {
        let mut input = lines(b"hello worldNEXT");
        let payload = read_content_length(&mut input, 11, &config()).await.unwrap();
        assert_eq!(in_memory(payload).await, b"hello world");
        let mut rest = [0u8; 4];
        input.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"NEXT");
    }

    #[tokio::test]
    async fn content_length_short_read_fails() {
        let mut input = lines(b"abc");
        assert!(matches!(
            read_content_length(&mut input, 5, &config()).await,
            Err(ConnectionError::SocketIo(_))
        ));
    }

    #[tokio::test]
    async fn content_length_over_limit_fails_before_reading() {
        let mut input = lines(b"");
        assert!(matches!(
            read_content_length(&mut input, 65, &config()).await,
            Err(ConnectionError::ContentTooLarge { limit: 64 })
        ));
    }

    #[tokio::test]
    async fn chunked_decodes_and_ignores_extensions_and_trailers() {
        let mut input = lines(b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: y\r\n\r\nGET");
        let payload = read_chunked(&mut input, &config()).await.unwrap();
        assert_eq!(in_memory(payload).await, b"hello world");
    }

    #[tokio::test]
    async fn chunked_missing_crlf_after_data_fails() {
        let mut input = lines(b"3\r\nabcXY0\r\n\r\n");
        assert!(matches!(
            read_chunked(&mut input, &config()).await,
            Err(ConnectionError::ChunkedDecode(_))
        ));
    }

    #[tokio::test]
    async fn chunked_bad_size_fails() {
        let mut input = lines(b"zz\r\nabc\r\n0\r\n\r\n");
        assert!(matches!(
            read_chunked(&mut input, &config()).await,
            Err(ConnectionError::ChunkedDecode(_))
        ));
    }

    #[tokio::test]
    async fn chunked_total_over_limit_fails() {
        let mut input = lines(b"20\r\n");
        let mut cfg = config();
        cfg.max_chunked_length = 16;
        assert!(matches!(
            read_chunked(&mut input, &cfg).await,
            Err(ConnectionError::ContentTooLarge { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn gzip_inflates_in_memory_payload() {
        let payload = Payload::InMemory(gzip(b"compressed body").into());
        let inflated = gunzip(payload, &config()).await.unwrap();
        assert_eq!(in_memory(inflated).await, b"compressed body");
    }

    #[tokio::test]
    async fn gzip_bomb_is_bounded() {
        let payload = Payload::InMemory(gzip(&[0u8; 4096]).into());
        assert!(matches!(
            gunzip(payload, &config()).await,
            Err(ConnectionError::ContentTooLarge { limit: 64 })
        ));
    }

    #[tokio::test]
    async fn garbage_gzip_fails() {
        let payload = Payload::InMemory(b"definitely not gzip".to_vec().into());
        assert!(matches!(
            gunzip(payload, &config()).await,
            Err(ConnectionError::GzipDecode(_))
        ));
    }

    #[tokio::test]
    async fn read_body_without_framing_is_none() {
        let mut input = lines(b"");
        let body = read_body(&mut input, &headers(&[("Host", "x")]), &config())
            .await
            .unwrap();
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn read_body_rejects_unknown_transfer_coding() {
        let mut input = lines(b"");
        let err = read_body(&mut input, &headers(&[("Transfer-Encoding", "compress")]), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedTransferEncoding(c) if c == "compress"));
    }

    #[tokio::test]
    async fn read_body_rejects_conflicting_lengths() {
        let mut input = lines(b"abc");
        let err = read_body(&mut input, &headers(&[("Content-Length", "3, 4")]), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidContentLength(_)));
    }

    #[tokio::test]
    async fn read_body_chunked_gzip_urlencoded() {
        let compressed = gzip(b"a=1&b=two%20words");
        let mut wire = format!("{:x}\r\n", compressed.len()).into_bytes();
        wire.extend_from_slice(&compressed);
        wire.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut cfg = config();
        cfg.max_chunk_size = 8;
        cfg.max_chunked_length = 1024;
        let mut input = lines(&wire);
        let body = read_body(
            &mut input,
            &headers(&[
                ("Transfer-Encoding", "chunked"),
                ("Content-Encoding", "gzip"),
                ("Content-Type", "application/x-www-form-urlencoded"),
            ]),
            &cfg,
        )
        .await
        .unwrap()
        .unwrap();

        assert!(body.content.is_chunked());
        assert!(body.content.is_gzip());
        let form = body.form.unwrap();
        assert_eq!(form.field("a"), Some("1"));
        assert_eq!(form.field("b"), Some("two words"));
    }

    #[tokio::test]
    async fn multipart_without_boundary_fails() {
        let mut input = lines(b"xx");
        let err = read_body(
            &mut input,
            &headers(&[("Content-Type", "multipart/form-data"), ("Content-Length", "2")]),
            &config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectionError::MultipartFormat(_)));
    }

    #[tokio::test]
    async fn content_length_must_be_digits_only() {
        for value in ["+5", "-5", "5 5", "0x5"] {
            let mut input = lines(b"hello");
            let err = read_body(&mut input, &headers(&[("Content-Length", value)]), &config())
                .await
                .unwrap_err();
            assert!(matches!(err, ConnectionError::InvalidContentLength(_)), "{value:?}");
        }
    }

    #[tokio::test]
    async fn spooled_form_with_unbounded_limit_decodes() {
        let cfg = ServerConfig {
            spool_threshold: 4,
            max_content_length: u64::MAX,
            ..ServerConfig::default()
        };
        let mut input = lines(b"a=1&b=two%20words");
        let body = read_body(
            &mut input,
            &headers(&[
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("Content-Length", "17"),
            ]),
            &cfg,
        )
        .await
        .unwrap()
        .unwrap();
        let form = body.form.unwrap();
        assert_eq!(form.field("a"), Some("1"));
        assert_eq!(form.field("b"), Some("two words"));
    }

    #[tokio::test]
    async fn gzip_over_threshold_is_spooled_to_disk() {
        let text = b"spooled and inflated ".repeat(8);
        let compressed = gzip(&text);
        let cfg = ServerConfig {
            spool_threshold: 16,
            max_chunk_size: 8,
            max_content_length: 4096,
            ..ServerConfig::default()
        };
        let length = compressed.len().to_string();
        let mut input = lines(&compressed);
        let body = read_body(
            &mut input,
            &headers(&[
                ("Content-Type", "text/plain"),
                ("Content-Length", length.as_str()),
                ("Content-Encoding", "gzip"),
            ]),
            &cfg,
        )
        .await
        .unwrap()
        .unwrap();

        let Payload::Spooled(file) = body.content.payload() else {
            panic!("expected a spooled payload, got {:?}", body.content.payload());
        };
        let path = file.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(body.content.len(), Some(text.len() as u64));
        assert_eq!(&body.content.read_bytes().await.unwrap()[..], &text[..]);

        drop(body);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn gunzip_reads_spooled_input() {
        let text = b"from a file on disk ".repeat(4);
        let mut sink = BodySink::new(&std::env::temp_dir(), 0);
        sink.write(&gzip(&text)).await.unwrap();
        let spooled = sink.finish().await.unwrap();
        assert!(matches!(spooled, Payload::Spooled(_)));

        let cfg = ServerConfig {
            spool_threshold: 8,
            max_content_length: 1024,
            ..config()
        };
        let inflated = gunzip(spooled, &cfg).await.unwrap();
        assert!(matches!(inflated, Payload::Spooled(_)));
        assert_eq!(in_memory(inflated).await, text);
    }
}
