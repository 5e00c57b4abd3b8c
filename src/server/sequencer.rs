//! Response sequencer: writes responses in request order, whatever order they
//! finish in.
//!
//! Workers hand finished responses to [`ResponseSequencer::send`] from any
//! task. A response whose id is ahead of the cursor is parked until every
//! earlier id has been written. Writing a response marked `close` shuts the
//! writer down; anything parked behind it is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::codec::{EncodeOptions, write_response};
use crate::error::ConnectionError;
use crate::http::Response;

struct State<W> {
    writer: Option<W>,
    pending: BTreeMap<u64, Response>,
    cursor: u64,
}

/// Orders and writes the responses of one connection.
pub struct ResponseSequencer<W> {
    state: Mutex<State<W>>,
    closed: AtomicBool,
    close_notify: Notify,
    options: EncodeOptions,
}

impl<W: AsyncWrite + Unpin + Send> ResponseSequencer<W> {
    pub fn new(writer: W, options: EncodeOptions) -> Self {
        Self {
            state: Mutex::new(State {
                writer: Some(writer),
                pending: BTreeMap::new(),
                cursor: 0,
            }),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            options,
        }
    }

    /// Queues `response` and writes every response that is now in order.
    ///
    /// Returns how many responses were written by this call. Responses for
    /// ids already written, or arriving after the connection closed, are
    /// discarded.
    ///
    /// # Errors
    ///
    /// A write failure closes the sequencer and is returned to the caller
    /// whose call hit it.
    pub async fn send(&self, response: Response) -> Result<usize, ConnectionError> {
        let mut state = self.state.lock().await;
        let id = response.id();

        if state.writer.is_none() || id < state.cursor {
            debug!(id, cursor = state.cursor, "discarding response");
            return Ok(0);
        }
        if state.pending.insert(id, response).is_some() {
            debug!(id, "duplicate response id; keeping the latest");
        }

        let mut written = 0;
        loop {
            let cursor = state.cursor;
            let Some(next) = state.pending.remove(&cursor) else {
                break;
            };
            let close = next.is_close();
            let Some(writer) = state.writer.as_mut() else {
                break;
            };

            trace!(id = cursor, status = %next.status(), "writing response");
            if let Err(e) = write_response(writer, next, &self.options).await {
                self.shut(&mut state).await;
                return Err(e);
            }
            state.cursor += 1;
            written += 1;

            if close {
                debug!(id = cursor, "response closes the connection");
                self.shut(&mut state).await;
                break;
            }
        }

        Ok(written)
    }

    /// Closes the writer without a response, discarding anything parked.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.shut(&mut state).await;
    }

    /// Returns `true` once a close response was written or the writer failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the sequencer has closed.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // Registered before the flag check so a concurrent close is not missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Number of responses parked behind a gap.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// The id of the next response to be written.
    pub async fn cursor(&self) -> u64 {
        self.state.lock().await.cursor
    }

    /// Takes the writer back, if it was not shut down.
    pub fn into_inner(self) -> Option<W> {
        self.state.into_inner().writer
    }

    async fn shut(&self, state: &mut State<W>) {
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(error = %e, "writer shutdown failed");
            }
        }
        if !state.pending.is_empty() {
            debug!(dropped = state.pending.len(), "dropping responses queued behind close");
            state.pending.clear();
        }
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::http::StatusCode;

    fn options() -> EncodeOptions {
        EncodeOptions {
            max_chunk_size: 1024,
            temp_dir: std::env::temp_dir(),
        }
    }

    fn reply(id: u64, body: &str) -> Response {
        Response::new(StatusCode::Ok).body(body.to_owned()).with_id(id)
    }

    fn bodies(output: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(output)
            .split("HTTP/1.1 ")
            .filter(|s| !s.is_empty())
            .map(|s| s.rsplit("\r\n\r\n").next().unwrap_or_default().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn out_of_order_completions_are_written_in_order() {
        let sequencer = ResponseSequencer::new(Vec::new(), options());

        assert_eq!(sequencer.send(reply(2, "two")).await.unwrap(), 0);
        assert_eq!(sequencer.send(reply(0, "zero")).await.unwrap(), 1);
        assert_eq!(sequencer.pending_len().await, 1);
        assert_eq!(sequencer.send(reply(1, "one")).await.unwrap(), 2);
        assert_eq!(sequencer.cursor().await, 3);

        let output = sequencer.into_inner().unwrap();
        assert_eq!(bodies(&output), vec!["zero", "one", "two"]);
    }

    #[tokio::test]
    async fn close_response_drops_later_entries() {
        let sequencer = ResponseSequencer::new(Vec::new(), options());

        sequencer.send(reply(2, "late")).await.unwrap();
        sequencer.send(reply(1, "bye").close()).await.unwrap();
        assert!(!sequencer.is_closed());
        assert_eq!(sequencer.send(reply(0, "first")).await.unwrap(), 2);

        assert!(sequencer.is_closed());
        assert_eq!(sequencer.pending_len().await, 0);
        assert_eq!(sequencer.send(reply(3, "ignored")).await.unwrap(), 0);
        assert!(sequencer.into_inner().is_none());
    }

    #[tokio::test]
    async fn stale_ids_are_ignored() {
        let sequencer = ResponseSequencer::new(Vec::new(), options());
        sequencer.send(reply(0, "a")).await.unwrap();
        assert_eq!(sequencer.send(reply(0, "again")).await.unwrap(), 0);
        assert_eq!(bodies(&sequencer.into_inner().unwrap()), vec!["a"]);
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let sequencer = Arc::new(ResponseSequencer::new(Vec::new(), options()));
        let waiter = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move { sequencer.closed().await })
        };
        sequencer.send(reply(0, "x").close()).await.unwrap();
        waiter.await.unwrap();
        // Already closed: returns immediately.
        sequencer.closed().await;
    }

    #[tokio::test]
    async fn concurrent_senders_preserve_order() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let sequencer = Arc::new(ResponseSequencer::new(server, options()));

        let mut tasks = Vec::new();
        for id in (0..16u64).rev() {
            let sequencer = Arc::clone(&sequencer);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(id % 5)).await;
                let response = reply(id, &format!("r{id}"));
                let response = if id == 15 { response.close() } else { response };
                sequencer.send(response).await.unwrap()
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 16);

        let mut output = Vec::new();
        let mut client = client;
        client.read_to_end(&mut output).await.unwrap();
        let expected: Vec<String> = (0..16).map(|id| format!("r{id}")).collect();
        assert_eq!(bodies(&output), expected);
    }
}
