//! StreamingConnection (C2): turns a bidirectional WebSocket into two
//! in-process queues (`received`, `ready_to_send`) with per-session id
//! gating and RESET propagation.
//!
//! Grounded on the original `streaming_connection.py`'s
//! `asyncio.wait(..., FIRST_COMPLETED)` read/write race (reproduced here
//! with `tokio::select!` inside an outer loop) and on `canvas/remote.rs`'s
//! connect/split/select-loop shape. The downstream dial *policy*
//! (fixed-interval retry, not exponential backoff) lives in
//! [`crate::server`], grounded on `base_server.py` instead.

use crate::codec::{self, Frame};
use crate::error::{PipelineError, Result};
use crate::POLL_INTERVAL;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Duplex framed channel over one WebSocket, gated to a single session id.
///
/// Cheap to clone: internal state is synchronized, so a clone shares the
/// same connection with its origin. The owner of a connection spawns
/// [`StreamingConnection::run`] on a clone as a background task and keeps
/// another clone to call `send`/`recv`/`reset` from the main loop.
#[derive(Clone)]
pub struct StreamingConnection {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    name: String,
    communication_id: Mutex<Option<String>>,
    closed: AtomicBool,
    received_tx: Mutex<mpsc::UnboundedSender<Frame>>,
    received_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    ready_tx: Mutex<mpsc::UnboundedSender<Frame>>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    shutdown: CancellationToken,
}

impl StreamingConnection {
    /// Create a connection not yet attached to a transport. `name` is used
    /// only for diagnostics (tracing spans, error messages).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            inner: std::sync::Arc::new(Inner {
                name: name.into(),
                communication_id: Mutex::new(None),
                closed: AtomicBool::new(false),
                received_tx: Mutex::new(received_tx),
                received_rx: Mutex::new(received_rx),
                ready_tx: Mutex::new(ready_tx),
                ready_rx: Mutex::new(ready_rx),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn communication_id(&self) -> Option<String> {
        self.inner.communication_id.lock().unwrap().clone()
    }

    /// Long-running read/write loop over `transport`. Exits when the
    /// transport closes cleanly, errors, or [`StreamingConnection::close`]
    /// is called. Intended to be driven inside its own `tokio::spawn`ed
    /// task by the server scaffold.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ConnectionClosed`] if the transport errors
    /// (as opposed to closing cleanly, which returns `Ok(())`).
    pub async fn run<S>(&self, transport: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<WsMessage, WsError>>
            + Sink<WsMessage, Error = WsError>
            + Unpin
            + Send,
    {
        let span = tracing::info_span!("streaming_connection", name = %self.inner.name);
        let _entered = span.enter();
        let (mut write, mut read) = transport.split();
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => {
                    let _ = write.close().await;
                    self.inner.closed.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.route_inbound(&text),
                        Some(Ok(WsMessage::Close(_))) | None => {
                            self.inner.closed.store(true, Ordering::SeqCst);
                            return Ok(());
                        }
                        Some(Ok(_)) => {} // ignore binary/ping/pong/frame
                        Some(Err(e)) => {
                            self.inner.closed.store(true, Ordering::SeqCst);
                            return Err(PipelineError::ConnectionClosed(e.to_string()));
                        }
                    }
                }
                result = self.send_one(&mut write) => {
                    if let Err(e) = result {
                        self.inner.closed.store(true, Ordering::SeqCst);
                        return Err(PipelineError::ConnectionClosed(e.to_string()));
                    }
                }
            }
        }
    }

    async fn send_one<S>(&self, transport: &mut S) -> std::result::Result<(), WsError>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
    {
        let popped = self.inner.ready_rx.lock().unwrap().try_recv().ok();
        match popped {
            Some(frame) => transport.send(WsMessage::Text(codec::encode(&frame))).await,
            None => {
                tokio::time::sleep(POLL_INTERVAL).await;
                Ok(())
            }
        }
    }

    fn route_inbound(&self, text: &str) {
        match codec::decode(text) {
            Ok(frame) if frame.status() == Some("RESET") => {
                if let Some(id) = frame.id() {
                    self.reset(id, false);
                }
            }
            Ok(frame) if self.is_valid_id(frame.id()) => {
                let _ = self.inner.received_tx.lock().unwrap().send(frame);
            }
            Ok(frame) => {
                tracing::debug!(name = %self.inner.name, id = ?frame.id(), "dropping frame: id mismatch");
            }
            Err(e) => {
                tracing::debug!(name = %self.inner.name, error = %e, "dropping malformed frame");
            }
        }
    }

    fn is_valid_id(&self, id: Option<&str>) -> bool {
        match &*self.inner.communication_id.lock().unwrap() {
            None => true,
            Some(current) => id == Some(current.as_str()),
        }
    }

    /// Non-blocking enqueue onto `ready_to_send`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConnectionClosed`] if the connection is closed.
    /// [`PipelineError::StreamReset`] if `frame`'s id disagrees with the
    /// current session id.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::ConnectionClosed(self.inner.name.clone()));
        }
        if !self.is_valid_id(frame.id()) {
            let expected = self.communication_id().unwrap_or_default();
            return Err(PipelineError::StreamReset { expected });
        }
        self.inner
            .ready_tx
            .lock()
            .unwrap()
            .send(frame)
            .map_err(|_| PipelineError::Channel("ready_to_send closed".to_string()))
    }

    /// Drains every frame currently buffered on `received`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConnectionClosed`] if the connection is closed and
    /// nothing was buffered.
    pub fn recv(&self) -> Result<Vec<Frame>> {
        let mut rx = self.inner.received_rx.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        drop(rx);
        if out.is_empty() && self.is_closed() {
            return Err(PipelineError::ConnectionClosed(self.inner.name.clone()));
        }
        Ok(out)
    }

    /// Sets the accepted session id, drops both queues, and (if
    /// `propagate`) enqueues a single `{id, status: RESET}` frame.
    ///
    /// A *received* `RESET` must call this with `propagate = false` —
    /// propagating it back would create a reset loop between the two
    /// peers of one connection.
    pub fn reset(&self, new_id: impl Into<String>, propagate: bool) {
        let new_id = new_id.into();
        *self.inner.communication_id.lock().unwrap() = Some(new_id.clone());

        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        *self.inner.received_tx.lock().unwrap() = recv_tx;
        *self.inner.received_rx.lock().unwrap() = recv_rx;

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        *self.inner.ready_tx.lock().unwrap() = ready_tx;
        *self.inner.ready_rx.lock().unwrap() = ready_rx;

        if propagate {
            let _ = self.send(Frame::reset(&new_id));
        }
    }

    /// Drains whatever is queued for send, without a transport attached.
    /// Lets other modules' tests assert on what a stage queued for a peer.
    #[cfg(test)]
    pub(crate) fn drain_ready(&self) -> Vec<Frame> {
        let mut rx = self.inner.ready_rx.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Closes the underlying transport. `run()` observes this on its next
    /// select iteration and returns.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_accepts_any_id() {
        let conn = StreamingConnection::new("test");
        assert!(conn.send(Frame::new().with("id", "a").with("text", "hi")).is_ok());
    }

    #[test]
    fn reset_gates_subsequent_sends() {
        let conn = StreamingConnection::new("test");
        conn.reset("a", false);
        assert!(conn.send(Frame::new().with("id", "a").with("text", "hi")).is_ok());
        let err = conn.send(Frame::new().with("id", "b").with("text", "nope")).unwrap_err();
        assert!(matches!(err, PipelineError::StreamReset { expected } if expected == "a"));
    }

    #[test]
    fn reset_drops_pending_queues() {
        let conn = StreamingConnection::new("test");
        conn.reset("a", false);
        conn.send(Frame::new().with("id", "a").with("seq", 1i64)).unwrap();
        conn.inner.received_tx.lock().unwrap().send(Frame::new().with("id", "a").with("seq", 1i64)).unwrap();
        conn.reset("b", false);
        assert_eq!(conn.recv().unwrap().len(), 0);
    }

    #[test]
    fn inbound_reset_does_not_propagate_back() {
        let conn = StreamingConnection::new("test");
        conn.route_inbound(&codec::encode(&Frame::reset("a")));
        assert_eq!(conn.communication_id().as_deref(), Some("a"));
        // the RESET frame itself must not have been enqueued for receipt...
        assert_eq!(conn.recv().unwrap().len(), 0);
        // ...nor queued for re-send back out.
        assert!(conn.inner.ready_rx.lock().unwrap().try_recv().is_err());
    }

    #[test]
    fn closed_connection_fails_send_and_empty_recv() {
        let conn = StreamingConnection::new("test");
        conn.close();
        assert!(matches!(
            conn.send(Frame::new().with("id", "a")),
            Err(PipelineError::ConnectionClosed(_))
        ));
        assert!(matches!(conn.recv(), Err(PipelineError::ConnectionClosed(_))));
    }

    #[test]
    fn mismatched_id_dropped_silently_not_enqueued() {
        let conn = StreamingConnection::new("test");
        conn.reset("a", false);
        conn.route_inbound(&codec::encode(&Frame::new().with("id", "b").with("text", "intruder")));
        assert_eq!(conn.recv().unwrap().len(), 0);
    }

    #[test]
    fn ordered_delivery_under_interleaved_ids() {
        let conn = StreamingConnection::new("test");
        conn.reset("a", false);
        for (id, seq) in [("a", 1), ("b", 1), ("a", 2), ("b", 2), ("a", 3)] {
            conn.route_inbound(&codec::encode(&Frame::new().with("id", id).with("seq", seq)));
        }
        let received = conn.recv().unwrap();
        let seqs: Vec<i64> = received.iter().map(|f| f.get("seq").and_then(codec::Value::as_i64).unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
