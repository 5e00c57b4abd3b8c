//! Response serialization.
//!
//! A body is framed with `Content-Length` when chunking was not requested and
//! its size is known up front; otherwise it is sent with chunked transfer
//! coding. Gzip output is produced before the framing decision, except for live
//! streams which are compressed on the fly.

use std::io::{self, Write};
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::spool::BodySink;
use super::{ByteStream, Payload};
use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::http::response::head_bytes;
use crate::http::{Response, StatusCode};

/// Settings the encoder takes from the server configuration.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Largest piece written in one step, and largest chunk emitted.
    pub max_chunk_size: usize,
    pub temp_dir: PathBuf,
}

impl From<&ServerConfig> for EncodeOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            temp_dir: config.temp_dir.clone(),
        }
    }
}

/// Writes `response` onto `writer` and flushes it.
pub async fn write_response<W>(
    writer: &mut W,
    response: Response,
    options: &EncodeOptions,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let (status, mut headers, content, close) = response.into_parts();
    headers.set("Connection", if close { "close" } else { "keep-alive" });

    let Some(content) = content else {
        if !matches!(
            status,
            StatusCode::NoContent
                | StatusCode::NotModified
                | StatusCode::Continue
                | StatusCode::SwitchingProtocols
        ) {
            headers.set("Content-Length", "0");
        }
        writer.write_all(&head_bytes(status, &headers)).await?;
        writer.flush().await?;
        return Ok(());
    };

    if !headers.contains("content-type") && !content.content_type().is_empty() {
        headers.set("Content-Type", content.content_type());
    }
    if let Some(filename) = content.suggested_filename() {
        headers.set(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename.replace('"', "")),
        );
    }

    let chunked = content.is_chunked();
    let gzip = content.is_gzip();
    let mut payload = content.into_payload();
    if gzip {
        headers.set("Content-Encoding", "gzip");
        if !matches!(payload, Payload::Streamed(_)) {
            payload = gzip_payload(payload, options).await?;
        }
    }

    let piece = options.max_chunk_size;
    match payload.len() {
        Some(len) if !chunked => {
            headers.set("Content-Length", len.to_string());
            writer.write_all(&head_bytes(status, &headers)).await?;
            let reader = payload.into_reader().await?;
            write_exact_length(writer, reader, len, piece).await?;
        }
        _ => {
            headers.remove("content-length");
            headers.set("Transfer-Encoding", "chunked");
            writer.write_all(&head_bytes(status, &headers)).await?;
            // Known-length payloads were already compressed above.
            let compress = gzip && matches!(payload, Payload::Streamed(_));
            let reader = payload.into_reader().await?;
            write_chunked(writer, reader, compress, piece).await?;
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Deflates a known-length payload. File-backed payloads are compressed
/// through a new spool file.
pub async fn gzip_payload(payload: Payload, options: &EncodeOptions) -> io::Result<Payload> {
    match payload {
        Payload::InMemory(bytes) => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
            encoder.write_all(&bytes)?;
            Ok(Payload::InMemory(encoder.finish()?.into()))
        }
        Payload::Spooled(file) => {
            let mut reader = Payload::Spooled(file).into_reader().await?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let mut sink = BodySink::new(&options.temp_dir, 0);
            let mut piece = vec![0u8; options.max_chunk_size];
            loop {
                let n = reader.read(&mut piece).await?;
                if n == 0 {
                    break;
                }
                encoder.write_all(&piece[..n])?;
                sink.write(&std::mem::take(encoder.get_mut())).await?;
            }
            sink.write(&encoder.finish()?).await?;
            sink.finish().await
        }
        streamed @ Payload::Streamed(_) => Ok(streamed),
    }
}

async fn write_exact_length<W>(
    writer: &mut W,
    reader: ByteStream,
    len: u64,
    piece_size: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = reader.take(len);
    let mut piece = vec![0u8; piece_size];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut piece).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&piece[..n]).await?;
        written += n as u64;
    }
    if written != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("payload ended after {written} of {len} bytes"),
        ));
    }
    Ok(())
}

async fn write_chunked<W>(
    writer: &mut W,
    mut reader: ByteStream,
    compress: bool,
    piece_size: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoder = compress.then(|| GzEncoder::new(Vec::new(), Compression::default()));
    let mut piece = vec![0u8; piece_size];

    loop {
        let n = reader.read(&mut piece).await?;
        if n == 0 {
            break;
        }
        match encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(&piece[..n])?;
                let deflated = std::mem::take(encoder.get_mut());
                write_chunks(writer, &deflated, piece_size).await?;
            }
            None => write_chunks(writer, &piece[..n], piece_size).await?,
        }
    }

    if let Some(encoder) = encoder {
        write_chunks(writer, &encoder.finish()?, piece_size).await?;
    }
    writer.write_all(b"0\r\n\r\n").await
}

// Emits `data` as one or more chunks, flushing after each. Empty data emits
// nothing, since a zero-size chunk ends the body.
async fn write_chunks<W>(writer: &mut W, data: &[u8], piece_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in data.chunks(piece_size) {
        writer.write_all(format!("{:X}\r\n", chunk.len()).as_bytes()).await?;
        writer.write_all(chunk).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;
    use std::time::Duration;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::codec::decode::read_chunked;
    use crate::codec::{Content, LineReader};

    const PIECE: usize = 8;

    fn options() -> EncodeOptions {
        EncodeOptions {
            max_chunk_size: PIECE,
            temp_dir: std::env::temp_dir(),
        }
    }

    async fn encode(response: Response) -> Vec<u8> {
        let mut out = Vec::new();
        write_response(&mut out, response, &options()).await.unwrap();
        out
    }

    fn split_head(wire: &[u8]) -> (String, &[u8]) {
        let end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        (String::from_utf8(wire[..end].to_vec()).unwrap(), &wire[end..])
    }

    #[tokio::test]
    async fn empty_response_has_zero_length() {
        let wire = encode(Response::new(StatusCode::Ok)).await;
        assert_eq!(
            String::from_utf8(wire).unwrap(),
            "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn no_content_omits_length() {
        let wire = encode(Response::new(StatusCode::NoContent).close()).await;
        let (head, _) = split_head(&wire);
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn known_length_uses_content_length() {
        let wire = encode(Response::new(StatusCode::Ok).body("Hello")).await;
        let (head, body) = split_head(&wire);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"Hello");
    }

    #[tokio::test]
    async fn explicit_content_type_header_wins() {
        let wire = encode(
            Response::new(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body("{}"),
        )
        .await;
        let (head, _) = split_head(&wire);
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(!head.contains("text/plain"));
    }

    #[tokio::test]
    async fn chunk_round_trip_around_piece_size() {
        for size in [PIECE - 3, PIECE, PIECE * 3 + 1] {
            let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
            let wire = encode(
                Response::new(StatusCode::Ok)
                    .content(Content::bytes("application/octet-stream", data.clone()).chunked()),
            )
            .await;
            let (head, body) = split_head(&wire);
            assert!(head.contains("Transfer-Encoding: chunked\r\n"));
            assert!(body.ends_with(b"0\r\n\r\n"));

            let config = ServerConfig {
                max_chunk_size: PIECE,
                ..ServerConfig::default()
            };
            let mut lines = LineReader::new(body, 64, Duration::from_secs(5));
            let decoded = read_chunked(&mut lines, &config).await.unwrap();
            assert_eq!(decoded.into_bytes(1 << 20).await.unwrap().to_vec(), data);
        }
    }

    #[tokio::test]
    async fn chunk_pieces_are_bounded() {
        let wire = encode(
            Response::new(StatusCode::Ok).content(Content::text("abcdefghij").chunked()),
        )
        .await;
        let (_, body) = split_head(&wire);
        assert_eq!(body, b"8\r\nabcdefgh\r\n2\r\nij\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn stream_is_always_chunked() {
        let stream: ByteStream = Box::new(io::Cursor::new(b"streamed".to_vec()));
        let wire = encode(Response::new(StatusCode::Ok).content(Content::stream("text/plain", stream))).await;
        let (head, body) = split_head(&wire);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(body, b"8\r\nstreamed\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn gzip_output_with_length() {
        let text = "repeat ".repeat(50);
        let wire = encode(Response::new(StatusCode::Ok).content(Content::text(text.clone()).gzip())).await;
        let (head, body) = split_head(&wire);
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));

        let mut inflated = String::new();
        GzDecoder::new(body).read_to_string(&mut inflated).unwrap();
        assert_eq!(inflated, text);
    }

    #[tokio::test]
    async fn gzip_stream_compresses_on_the_fly() {
        let text = "stream me ".repeat(20);
        let stream: ByteStream = Box::new(io::Cursor::new(text.clone().into_bytes()));
        let wire = encode(
            Response::new(StatusCode::Ok).content(Content::stream("text/plain", stream).gzip()),
        )
        .await;
        let (_, body) = split_head(&wire);

        let config = ServerConfig {
            max_chunk_size: PIECE,
            ..ServerConfig::default()
        };
        let mut lines = LineReader::new(body, 64, Duration::from_secs(5));
        let deflated = read_chunked(&mut lines, &config).await.unwrap();
        let deflated = deflated.into_bytes(1 << 20).await.unwrap();

        let mut inflated = String::new();
        GzDecoder::new(&deflated[..]).read_to_string(&mut inflated).unwrap();
        assert_eq!(inflated, text);
    }

    #[tokio::test]
    async fn filename_sets_disposition() {
        let wire = encode(
            Response::new(StatusCode::Ok).content(Content::text("x").filename("report.txt")),
        )
        .await;
        let (head, _) = split_head(&wire);
        assert!(head.contains("Content-Disposition: attachment; filename=\"report.txt\"\r\n"));
    }

    #[tokio::test]
    async fn gzip_of_spooled_payload_spools_and_round_trips() {
        let text = "written to disk first ".repeat(10);
        let mut sink = BodySink::new(&std::env::temp_dir(), 0);
        sink.write(text.as_bytes()).await.unwrap();
        let spooled = sink.finish().await.unwrap();
        assert!(matches!(spooled, Payload::Spooled(_)));

        let deflated = gzip_payload(spooled, &options()).await.unwrap();
        assert!(matches!(deflated, Payload::Spooled(_)));
        let deflated = deflated.into_bytes(1 << 20).await.unwrap();

        let mut inflated = String::new();
        GzDecoder::new(&deflated[..]).read_to_string(&mut inflated).unwrap();
        assert_eq!(inflated, text);
    }

    #[tokio::test]
    async fn spooled_gzip_response_has_content_length() {
        let text = "spooled response body ".repeat(10);
        let mut sink = BodySink::new(&std::env::temp_dir(), 0);
        sink.write(text.as_bytes()).await.unwrap();
        let payload = sink.finish().await.unwrap();

        let wire = encode(
            Response::new(StatusCode::Ok).content(Content::new("text/plain", payload).gzip()),
        )
        .await;
        let (head, body) = split_head(&wire);
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));

        let mut inflated = String::new();
        GzDecoder::new(body).read_to_string(&mut inflated).unwrap();
        assert_eq!(inflated, text);
    }
}
