//! Per-connection driver: one read loop, concurrent handlers, ordered writes.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::reader::ConnectionReader;
use super::sequencer::ResponseSequencer;
use crate::codec::EncodeOptions;
use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::http::{Request, Response, StatusCode};
use crate::router::Registry;

/// Serves every request on `stream` until it closes.
///
/// Requests are read one after another; each is handed to its own task once a
/// permit from `workers` is available, so pipelined requests run concurrently.
/// Responses are written in request order by a [`ResponseSequencer`].
///
/// Returns after the last response was written. Protocol errors are answered
/// with a best-effort error response and returned; a clean close by the peer
/// returns `Ok(())`.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    workers: Arc<Semaphore>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let sequencer = Arc::new(ResponseSequencer::new(
        write_half,
        EncodeOptions::from(config.as_ref()),
    ));
    let mut reader = ConnectionReader::new(read_half, Arc::clone(&config));
    let mut tasks = JoinSet::new();

    let outcome = loop {
        let next = tokio::select! {
            next = reader.next_request() => next,
            () = sequencer.closed() => break Ok(()),
        };

        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(peer = %peer, "connection closed by peer");
                break Ok(());
            }
            Err(e) => {
                reject(&sequencer, &reader, &config, peer, &e).await;
                break Err(e);
            }
        };

        let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
            // Pool closed: the server is shutting down.
            break Ok(());
        };

        let last = request.closes_connection();
        debug!(
            peer = %peer,
            id = request.id(),
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let registry = Arc::clone(&registry);
        let sequencer = Arc::clone(&sequencer);
        let config = Arc::clone(&config);
        tasks.spawn(async move {
            let response = run_handler(&registry, &config, request).await;
            drop(permit);
            if let Err(e) = sequencer.send(response).await {
                debug!(peer = %peer, error = %e, "response write failed");
            }
        });

        if last {
            break Ok(());
        }
    };

    while tasks.join_next().await.is_some() {}
    // Nothing left to write; close if no response did it already.
    sequencer.close().await;
    outcome
}

// Runs the handler for `request` on its own task and turns every outcome into
// a response carrying the request's id.
async fn run_handler(registry: &Registry, config: &ServerConfig, request: Request) -> Response {
    let id = request.id();
    let close = request.closes_connection();
    let handler = tokio::spawn(registry.dispatch(request));

    let response = match tokio::time::timeout(config.handler_timeout(), handler).await {
        Ok(Ok(Ok(response))) => response,
        Ok(Ok(Err(e))) => {
            warn!(id, error = %e, "handler returned an error");
            let detail = e.to_string();
            internal_error(config, &detail)
        }
        Ok(Err(join)) => {
            let detail = match join.try_into_panic() {
                Ok(payload) => panic_message(payload.as_ref()),
                Err(join) => join.to_string(),
            };
            error!(id, panic = %detail, "handler panicked");
            internal_error(config, &detail)
        }
        Err(_) => {
            warn!(id, timeout = ?config.handler_timeout(), "handler timed out");
            Response::error(StatusCode::ServiceUnavailable, None).close()
        }
    };

    let response = response.with_id(id);
    if close { response.close() } else { response }
}

fn internal_error(config: &ServerConfig, detail: &str) -> Response {
    let detail = config.expose_error_details.then_some(detail);
    Response::error(StatusCode::InternalServerError, detail)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

// Queues the best-effort error response for a read failure, if the error has
// a status and an id is left to carry it.
async fn reject<R, W>(
    sequencer: &ResponseSequencer<W>,
    reader: &ConnectionReader<R>,
    config: &ServerConfig,
    peer: SocketAddr,
    e: &ConnectionError,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    match (e.status(), reader.error_response_id()) {
        (Some(status), Some(id)) => {
            warn!(peer = %peer, id, status = %status, error = %e, "rejecting request");
            let detail = e.to_string();
            let detail = config.expose_error_details.then_some(detail.as_str());
            let response = Response::error(status, detail).with_id(id).close();
            if let Err(e) = sequencer.send(response).await {
                debug!(peer = %peer, error = %e, "error response write failed");
            }
        }
        _ => warn!(peer = %peer, error = %e, "dropping connection"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    async fn exchange(registry: Registry, config: ServerConfig, input: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let driver = tokio::spawn(serve_connection(
            server,
            peer(),
            Arc::new(registry),
            Arc::new(config),
            Arc::new(Semaphore::new(8)),
        ));
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        let _ = driver.await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn handler_error_becomes_500_without_detail() {
        let mut registry = Registry::new();
        registry.get("/fail", |_ctx| async {
            Err::<Response, _>(std::io::Error::other("database unavailable"))
        });
        let output = exchange(registry, ServerConfig::default(), b"GET /fail HTTP/1.1\r\n\r\n").await;
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!output.contains("database unavailable"));
    }

    #[tokio::test]
    async fn handler_error_detail_when_exposed() {
        let mut registry = Registry::new();
        registry.get("/fail", |_ctx| async {
            Err::<Response, _>(std::io::Error::other("database unavailable"))
        });
        let config = ServerConfig {
            expose_error_details: true,
            ..ServerConfig::default()
        };
        let output = exchange(registry, config, b"GET /fail HTTP/1.1\r\n\r\n").await;
        assert!(output.ends_with("database unavailable"));
    }

    #[tokio::test]
    async fn stalled_handler_times_out_with_503_and_close() {
        let mut registry = Registry::new();
        registry.get("/slow", |_ctx| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Response::new(StatusCode::Ok)
        });
        registry.get("/fast", |_ctx| async { Response::new(StatusCode::Ok).body("fast") });
        let config = ServerConfig {
            handler_timeout_ms: 50,
            ..ServerConfig::default()
        };
        let output = exchange(
            registry,
            config,
            b"GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n",
        )
        .await;
        assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(!output.contains("fast"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400_after_earlier_responses() {
        let mut registry = Registry::new();
        registry.get("/", |_ctx| async { Response::new(StatusCode::Ok).body("ok") });
        let output = exchange(
            registry,
            ServerConfig::default(),
            b"GET / HTTP/1.1\r\n\r\nNONSENSE\r\n\r\n",
        )
        .await;
        let first = output.find("HTTP/1.1 200 OK").unwrap();
        let second = output.find("HTTP/1.1 400 Bad Request").unwrap();
        assert!(first < second);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
