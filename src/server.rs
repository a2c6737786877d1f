//! Server scaffold (C3): accept one client, dial downstreams, run every
//! connection's `run()` loop plus a stage-specific main loop, tear down on
//! first completion.
//!
//! The downstream dial policy — infinite retry at a **fixed** poll
//! interval, no backoff growth — is grounded on `base_server.py`'s
//! `_setup_connections`, deliberately not on `canvas/remote.rs`'s
//! capped-exponential-backoff schedule (that file's connect/split/
//! select-loop *mechanics* are reused in
//! [`crate::connection::StreamingConnection::run`]; its backoff *schedule*
//! is not).

use crate::codec::Frame;
use crate::connection::StreamingConnection;
use crate::error::{PipelineError, Result};
use crate::POLL_INTERVAL;
use async_trait::async_trait;
use futures_util::future::select_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// The set of live connections for one client session, keyed by stream
/// name (`"client"` plus one entry per declared downstream).
pub type Streams = HashMap<String, StreamingConnection>;

/// Stage-specific behavior plugged into the generic [`Server`] scaffold.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Downstream stream key -> WebSocket URI, dialed once per client.
    fn downstream_uris(&self) -> HashMap<String, String>;

    /// Runs once per accepted client, before downstreams are dialed.
    /// Defaults to nothing; STT overrides it to open a fresh conversation
    /// directory for the session.
    async fn on_client_connected(&self, _streams: &Streams) -> Result<()> {
        Ok(())
    }

    /// Drains newly-available client messages. Defaults to draining
    /// `streams["client"]`; stages that need to intercept out-of-band
    /// frames (STT's `ACTION` frames) override this.
    fn recv_client_messages(&self, streams: &Streams) -> Result<Vec<Frame>> {
        streams
            .get("client")
            .expect("client stream always present")
            .recv()
    }

    /// How many leading frames of `buffered` form one complete workload.
    /// `0` means "not yet complete".
    fn cutoff_index(&self, buffered: &[Frame]) -> usize;

    /// The stage-specific unit of work for one complete prefix. May stream
    /// partial results to any stream during execution. Observes `cancel`
    /// cooperatively (via [`crate::executor::ThreadExecutor`] or directly)
    /// to abort early when superseded by a new turn.
    async fn run_workload(&self, prefix: Vec<Frame>, streams: Streams, cancel: CancellationToken) -> Result<()>;
}

/// Generic lifecycle driver for one stage server.
pub struct Server<St: Stage> {
    name: String,
    host: String,
    port: u16,
    stage: Arc<St>,
}

impl<St: Stage> Server<St> {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, stage: St) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            stage: Arc::new(stage),
        }
    }

    /// Binds and accepts client connections forever, handling one at a
    /// time (no multi-client fairness; see the Non-goals).
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener cannot be bound at all.
    pub async fn serve_forever(&self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        tracing::info!(name = %self.name, host = %self.host, port = self.port, "listening");
        loop {
            let (socket, addr) = listener.accept().await?;
            tracing::info!(name = %self.name, %addr, "client connected");
            if let Err(e) = self.handle_connection(socket).await {
                tracing::warn!(name = %self.name, error = %e, "session ended with error");
            }
        }
    }

    async fn handle_connection(&self, client_socket: TcpStream) -> Result<()> {
        let client_ws = tokio_tungstenite::accept_async(client_socket)
            .await
            .map_err(|e| PipelineError::ConnectionClosed(e.to_string()))?;

        let client_conn = StreamingConnection::new("client");
        let mut streams: Streams = HashMap::new();
        streams.insert("client".to_string(), client_conn.clone());

        let mut io_tasks = Vec::new();
        {
            let conn = client_conn.clone();
            io_tasks.push(tokio::spawn(async move { conn.run(client_ws).await }));
        }

        self.stage.on_client_connected(&streams).await?;

        for (key, uri) in self.stage.downstream_uris() {
            let transport = dial_with_retry(&self.name, &key, &uri).await;
            let conn = StreamingConnection::new(key.clone());
            streams.insert(key, conn.clone());
            io_tasks.push(tokio::spawn(async move { conn.run(transport).await }));
        }

        let stage = self.stage.clone();
        let main_streams = streams.clone();
        let main_handle = tokio::spawn(async move { main_loop(stage, main_streams).await });

        // Wait for any task — an IO loop closing, or the main loop exiting
        // — then cancel everything else and close every stream.
        let mut all_handles = io_tasks;
        all_handles.push(main_handle);
        let (_result, _index, rest) = select_all(all_handles).await;
        for handle in rest {
            handle.abort();
        }
        for conn in streams.values() {
            conn.close();
        }
        Ok(())
    }
}

async fn dial_with_retry(
    server_name: &str,
    key: &str,
    uri: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
    loop {
        match tokio_tungstenite::connect_async(uri).await {
            Ok((stream, _response)) => {
                tracing::info!(name = server_name, key, uri, "downstream connected");
                return stream;
            }
            Err(e) => {
                tracing::debug!(name = server_name, key, uri, error = %e, "downstream dial failed, retrying");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// The default main loop described in the server-scaffold contract:
/// append newly-received client messages, and whenever a complete prefix
/// accumulates, reset every non-client stream to its id and dispatch a
/// workload, cancelling (cooperatively, not by hard `abort`) whichever
/// workload was still running for the previous turn.
///
/// A hard `abort()` of the previous workload is deliberately avoided: the
/// workload may be blocked inside a [`crate::executor::ThreadExecutor`]
/// run on a worker thread that cannot be preempted, so the only correct
/// cancellation is the cooperative token the workload itself polls.
async fn main_loop<St: Stage>(stage: Arc<St>, streams: Streams) -> Result<()> {
    let mut buffered: Vec<Frame> = Vec::new();
    let mut current_cancel: Option<CancellationToken> = None;

    loop {
        let new_messages = match stage.recv_client_messages(&streams) {
            Ok(messages) => messages,
            Err(PipelineError::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if new_messages.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        buffered.extend(new_messages);

        let cutoff = stage.cutoff_index(&buffered);
        if cutoff == 0 {
            continue;
        }
        let prefix: Vec<Frame> = buffered.drain(..cutoff).collect();
        let turn_id = prefix.first().and_then(Frame::id).map(str::to_string);

        if let Some(id) = &turn_id {
            for (key, conn) in &streams {
                if key != "client" {
                    conn.reset(id, true);
                }
            }
        }

        if let Some(previous) = current_cancel.take() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        current_cancel = Some(cancel.clone());
        let stage = stage.clone();
        let streams = streams.clone();
        tokio::spawn(async move {
            if let Err(e) = stage.run_workload(prefix, streams, cancel).await {
                tracing::debug!(error = %e, "workload ended with error");
            }
        });
    }
}
