//! STT stage (C5): the first hop in the pipeline. Buffers a turn's audio
//! chunks, transcribes the complete turn, persists it to a
//! [`crate::store::ConversationStore`], and either relays the transcript
//! straight to the client (`chat_mode: false`) or forwards it to the `chat`
//! downstream and relays whatever comes back (`chat_mode: true`).
//!
//! Also the only stage that intercepts out-of-band `ACTION` frames
//! (`DELETE`, `WRONG`, `NEW CONVERSATION`) ahead of the buffering main loop,
//! since those apply immediately rather than waiting for a turn boundary.

use crate::codec::{Frame, Value};
use crate::error::{PipelineError, Result};
use crate::executor::ThreadExecutor;
use crate::server::{Stage, Streams};
use crate::store::{self, ConversationStore};
use crate::transcriber::Transcriber;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct SttStage<T: Transcriber> {
    transcriber: Arc<T>,
    downstream: HashMap<String, String>,
    store_root: PathBuf,
    language: String,
    conversation: Mutex<Option<ConversationStore>>,
}

impl<T: Transcriber> SttStage<T> {
    #[must_use]
    pub fn new(
        transcriber: T,
        downstream: HashMap<String, String>,
        store_root: PathBuf,
        language: impl Into<String>,
    ) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            downstream,
            store_root,
            language: language.into(),
            conversation: Mutex::new(None),
        }
    }

    /// Handles one `ACTION` frame synchronously; these never enter the
    /// buffered turn and have no effect on `cutoff_index`.
    fn handle_action(&self, frame: &Frame, streams: &Streams) {
        match frame.action() {
            Some("DELETE") => {
                if let Some(path) = frame.save_path() {
                    if let Err(e) = store::delete_entry(Path::new(path)) {
                        tracing::warn!(error = %e, path, "failed to delete conversation");
                    }
                }
            }
            Some("WRONG") => {
                if let Some(path) = frame.save_path() {
                    if let Err(e) = store::mark_wrong(Path::new(path)) {
                        tracing::warn!(error = %e, path, "failed to mark conversation wrong");
                    }
                }
            }
            Some("NEW CONVERSATION") => {
                if let Some(chat) = streams.get("chat") {
                    if let Some(id) = frame.id() {
                        chat.reset(id, true);
                    }
                    let _ = chat.send(frame.clone());
                }
                match ConversationStore::create(&self.store_root, chrono::Utc::now()) {
                    Ok(fresh) => *self.conversation.lock().unwrap() = Some(fresh),
                    Err(e) => tracing::warn!(error = %e, "failed to start new conversation"),
                }
            }
            other => {
                tracing::debug!(action = ?other, "ignoring unrecognized action");
            }
        }
    }

    /// Persists the user's side of a turn and returns the `save_path` to
    /// attach to whatever response eventually reaches the client.
    fn record_user_turn(&self, text: &str, audio: &[u8], audio_config: &Frame) -> Option<String> {
        let mut guard = self.conversation.lock().unwrap();
        if guard.is_none() {
            *guard = ConversationStore::create(&self.store_root, chrono::Utc::now()).ok();
        }
        let conversation = guard.as_mut()?;
        if let Err(e) = conversation.append_turn(text, audio, audio_config) {
            tracing::warn!(error = %e, "failed to persist user turn");
        }
        Some(conversation.save_path())
    }

    /// Writes whatever assistant audio was buffered for the current turn.
    /// Called at every exit point of the chat-relay loop in
    /// [`Stage::run_workload`] — normal completion, interruption, and
    /// connection error alike — so a turn's assistant audio is finalized
    /// exactly once regardless of how the loop ended.
    fn finalize_assistant(&self, audio_config: Option<&Frame>) {
        let Some(audio_config) = audio_config else { return };
        let mut guard = self.conversation.lock().unwrap();
        if let Some(store) = guard.as_mut() {
            if let Err(e) = store.finalize_assistant_audio(audio_config) {
                tracing::warn!(error = %e, "failed to finalize assistant audio");
            }
        }
    }
}

#[async_trait]
impl<T: Transcriber> Stage for SttStage<T> {
    fn downstream_uris(&self) -> HashMap<String, String> {
        self.downstream.clone()
    }

    async fn on_client_connected(&self, _streams: &Streams) -> Result<()> {
        match ConversationStore::create(&self.store_root, chrono::Utc::now()) {
            Ok(fresh) => *self.conversation.lock().unwrap() = Some(fresh),
            Err(e) => tracing::warn!(error = %e, "failed to open conversation directory"),
        }
        Ok(())
    }

    fn recv_client_messages(&self, streams: &Streams) -> Result<Vec<Frame>> {
        let raw = streams.get("client").expect("client stream always present").recv()?;
        let mut turn_frames = Vec::with_capacity(raw.len());
        for frame in raw {
            if frame.status() == Some("ACTION") {
                self.handle_action(&frame, streams);
            } else {
                turn_frames.push(frame);
            }
        }
        Ok(turn_frames)
    }

    fn cutoff_index(&self, buffered: &[Frame]) -> usize {
        buffered
            .iter()
            .position(|f| f.status() == Some("FINISHED"))
            .map_or(0, |i| i + 1)
    }

    async fn run_workload(&self, prefix: Vec<Frame>, streams: Streams, cancel: CancellationToken) -> Result<()> {
        let Some(init) = prefix.first() else {
            return Ok(());
        };
        let id = init.id().unwrap_or_default().to_string();
        let audio_config = init.get("audio_config").and_then(Value::as_frame).cloned().unwrap_or_default();
        let chat_mode = init.chat_mode();

        let mut audio = Vec::new();
        for frame in &prefix {
            if let Some(bytes) = frame.audio() {
                audio.extend_from_slice(bytes);
            }
        }

        let transcriber = self.transcriber.clone();
        let language = self.language.clone();
        let thread_audio = audio.clone();
        let thread_config = audio_config.clone();
        let mut executor = ThreadExecutor::new();
        let text = executor
            .run_linked(&cancel, move |cancel| {
                transcriber.transcribe(&thread_audio, &thread_config, &language, &cancel)
            })
            .await?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        let save_path = self.record_user_turn(&text, &audio, &audio_config).unwrap_or_default();

        let client = streams.get("client").expect("client stream always present");

        if !chat_mode {
            client.send(
                Frame::new()
                    .with("id", id.as_str())
                    .with("status", "FINISHED")
                    .with("text", text)
                    .with("save_path", save_path),
            )?;
            return Ok(());
        }

        let Some(chat) = streams.get("chat") else {
            // Declared chat_mode but no chat downstream configured: fall back
            // to returning the transcript directly rather than hanging.
            client.send(
                Frame::new()
                    .with("id", id.as_str())
                    .with("status", "FINISHED")
                    .with("text", text)
                    .with("save_path", save_path),
            )?;
            return Ok(());
        };

        chat.send(
            Frame::new()
                .with("id", id.as_str())
                .with("status", "FINISHED")
                .with("text", text)
                .with("audio_config", audio_config),
        )?;

        let mut assistant_audio_config: Option<Frame> = None;
        loop {
            if cancel.is_cancelled() {
                self.finalize_assistant(assistant_audio_config.as_ref());
                return Ok(());
            }
            let replies = match chat.recv() {
                Ok(replies) => replies,
                Err(PipelineError::ConnectionClosed(_) | PipelineError::StreamReset { .. }) => {
                    self.finalize_assistant(assistant_audio_config.as_ref());
                    return Ok(());
                }
                Err(e) => {
                    self.finalize_assistant(assistant_audio_config.as_ref());
                    return Err(e);
                }
            };
            if replies.is_empty() {
                tokio::time::sleep(crate::POLL_INTERVAL).await;
                continue;
            }
            for mut reply in replies {
                let finished = reply.status() == Some("FINISHED");
                if let Some(chunk) = reply.text() {
                    let mut guard = self.conversation.lock().unwrap();
                    if let Some(store) = guard.as_mut() {
                        if let Err(e) = store.push_assistant_text(chunk) {
                            tracing::warn!(error = %e, "failed to persist assistant text");
                        }
                    }
                }
                if let Some(audio) = reply.audio().filter(|a| !a.is_empty()) {
                    if assistant_audio_config.is_none() {
                        assistant_audio_config = reply.get("audio_config").and_then(Value::as_frame).cloned();
                    }
                    let mut guard = self.conversation.lock().unwrap();
                    if let Some(store) = guard.as_mut() {
                        store.push_assistant_audio(audio);
                    }
                }
                reply.insert("save_path", save_path.clone());
                client.send(reply)?;
                if finished {
                    self.finalize_assistant(assistant_audio_config.as_ref());
                    return Ok(());
                }
            }
        }
    }
}
