//! LLM stage (C6): the middle hop. Every client message is its own complete
//! workload — a new user turn always cancels whatever reply is still being
//! generated for the previous one, mirroring the original prototype's
//! cancel-on-every-new-message main loop rather than waiting for any
//! buffering cutoff.
//!
//! History is committed two-phase: a candidate history (prior turns plus
//! the new user turn) is built up front, generation runs against a clone of
//! it, and the candidate only replaces `self.history` if generation ran to
//! completion without being cancelled. A cancelled turn leaves history
//! exactly as it was before the turn started.

use crate::codec::Frame;
use crate::error::{PipelineError, Result};
use crate::executor::ThreadExecutor;
use crate::generator::{HistoryTurn, TextGenerator};
use crate::server::{Stage, Streams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct LlmStage<G: TextGenerator> {
    generator: Arc<G>,
    downstream: HashMap<String, String>,
    system_prompt: String,
    history_cap: usize,
    history: Mutex<Vec<HistoryTurn>>,
}

impl<G: TextGenerator> LlmStage<G> {
    #[must_use]
    pub fn new(
        generator: G,
        downstream: HashMap<String, String>,
        system_prompt: impl Into<String>,
        history_cap: usize,
    ) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            generator: Arc::new(generator),
            downstream,
            history: Mutex::new(vec![HistoryTurn::new("system", system_prompt.clone())]),
            system_prompt,
            history_cap,
        }
    }

    fn reset_history(&self) {
        *self.history.lock().unwrap() = vec![HistoryTurn::new("system", self.system_prompt.clone())];
    }

    /// Caps the non-system tail of `candidate` to the most recent
    /// `history_cap` turns, then installs it as the committed history.
    /// `history_cap == 0` means unbounded.
    fn commit_history(&self, mut candidate: Vec<HistoryTurn>) {
        if self.history_cap > 0 {
            let system_len = candidate.iter().take_while(|t| t.role == "system").count();
            let tail = &candidate[system_len..];
            if tail.len() > self.history_cap {
                let trimmed: Vec<HistoryTurn> = tail[tail.len() - self.history_cap..].to_vec();
                candidate.truncate(system_len);
                candidate.extend(trimmed);
            }
        }
        *self.history.lock().unwrap() = candidate;
    }
}

#[async_trait]
impl<G: TextGenerator> Stage for LlmStage<G> {
    fn downstream_uris(&self) -> HashMap<String, String> {
        self.downstream.clone()
    }

    fn cutoff_index(&self, buffered: &[Frame]) -> usize {
        // Unlike STT/TTS, any single buffered message is already a complete
        // workload of its own.
        buffered.len()
    }

    async fn run_workload(&self, prefix: Vec<Frame>, streams: Streams, cancel: CancellationToken) -> Result<()> {
        let Some(frame) = prefix.into_iter().next() else {
            return Ok(());
        };
        let id = frame.id().unwrap_or_default().to_string();

        if frame.action() == Some("NEW CONVERSATION") {
            self.reset_history();
            if let Some(tts) = streams.get("tts") {
                tts.reset(&id, true);
            }
            return Ok(());
        }

        let Some(text) = frame.text() else {
            return Ok(());
        };
        let text = text.to_string();

        let client = streams.get("client").expect("client stream always present");
        let tts = streams.get("tts").cloned();

        client.send(Frame::new().with("id", id.as_str()).with("status", "GENERATING"))?;

        let mut candidate = self.history.lock().unwrap().clone();
        candidate.push(HistoryTurn::new("user", text));

        let generator = self.generator.clone();
        let candidate_for_thread = candidate.clone();
        let tts_for_pieces = tts.clone();
        let id_for_pieces = id.clone();
        let assistant_reply = Arc::new(Mutex::new(String::new()));
        let assistant_reply_for_sink = assistant_reply.clone();

        let mut executor = ThreadExecutor::new();
        let generation = executor
            .run_linked(&cancel, move |cancel| {
                let mut sink = |piece: &str, is_final: bool| -> Result<()> {
                    assistant_reply_for_sink.lock().unwrap().push_str(piece);
                    if let Some(tts) = &tts_for_pieces {
                        let status = if is_final { "FINISHED" } else { "GENERATING" };
                        tts.send(
                            Frame::new()
                                .with("id", id_for_pieces.as_str())
                                .with("status", status)
                                .with("text", piece.to_string()),
                        )?;
                    }
                    Ok(())
                };
                generator.generate(&candidate_for_thread, &cancel, &mut sink)
            })
            .await;

        generation?;

        if cancel.is_cancelled() {
            // Superseded by a new turn mid-generation: leave history
            // untouched and let the newer workload's own turn own the reply.
            return Ok(());
        }

        let reply_text = assistant_reply.lock().unwrap().clone();
        candidate.push(HistoryTurn::new("assistant", reply_text.clone()));
        self.commit_history(candidate);

        let Some(tts) = tts else {
            client.send(
                Frame::new().with("id", id.as_str()).with("status", "FINISHED").with("text", reply_text),
            )?;
            return Ok(());
        };

        // Relay TTS's incremental audio back to the client. If the TTS link
        // itself drops mid-reply, fall back to a direct FINISHED so the
        // client is never left waiting forever — the resilience branch the
        // original prototype's `chat.py` also takes.
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match tts.recv() {
                Ok(replies) if replies.is_empty() => {
                    tokio::time::sleep(crate::POLL_INTERVAL).await;
                }
                Ok(replies) => {
                    for reply in replies {
                        let finished = reply.status() == Some("FINISHED");
                        client.send(reply)?;
                        if finished {
                            return Ok(());
                        }
                    }
                }
                Err(PipelineError::ConnectionClosed(_) | PipelineError::StreamReset { .. }) => {
                    client.send(Frame::new().with("id", id.as_str()).with("status", "FINISHED"))?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StreamingConnection;
    use crate::generator::StubTextGenerator;

    fn stage() -> LlmStage<StubTextGenerator> {
        LlmStage::new(StubTextGenerator, HashMap::new(), "you are a helpful assistant", 0)
    }

    #[test]
    fn cutoff_index_is_buffered_len_when_nonempty() {
        let s = stage();
        assert_eq!(s.cutoff_index(&[]), 0);
        let buffered = vec![Frame::new().with("id", "a").with("text", "hi")];
        assert_eq!(s.cutoff_index(&buffered), 1);
    }

    #[tokio::test]
    async fn new_conversation_resets_history_without_generating() {
        let s = stage();
        {
            let mut h = s.history.lock().unwrap();
            h.push(HistoryTurn::new("user", "prior turn"));
        }
        let client = StreamingConnection::new("client");
        client.reset("t1", false);
        let mut streams = Streams::new();
        streams.insert("client".to_string(), client.clone());

        let frame = Frame::new().with("id", "t1").with("status", "ACTION").with("action", "NEW CONVERSATION");
        s.run_workload(vec![frame], streams, CancellationToken::new()).await.unwrap();

        let history = s.history.lock().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "system");
    }

    #[tokio::test]
    async fn run_workload_without_tts_replies_with_text_and_commits_history() {
        let s = stage();
        let client = StreamingConnection::new("client");
        client.reset("t1", false);
        let mut streams = Streams::new();
        streams.insert("client".to_string(), client.clone());

        let frame = Frame::new().with("id", "t1").with("status", "FINISHED").with("text", "hello there");
        s.run_workload(vec![frame], streams, CancellationToken::new()).await.unwrap();

        let sent = client.drain_ready();
        assert_eq!(sent.len(), 2); // GENERATING, then FINISHED
        assert_eq!(sent[0].status(), Some("GENERATING"));
        assert_eq!(sent[1].status(), Some("FINISHED"));
        assert!(sent[1].text().unwrap().contains("hello there"));

        let history = s.history.lock().unwrap();
        assert_eq!(history.len(), 3); // system, user, assistant
        assert_eq!(history[1].role, "user");
        assert_eq!(history[2].role, "assistant");
    }

    #[tokio::test]
    async fn cancellation_before_generation_leaves_history_untouched() {
        let s = stage();
        let client = StreamingConnection::new("client");
        client.reset("t1", false);
        let mut streams = Streams::new();
        streams.insert("client".to_string(), client.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let frame = Frame::new().with("id", "t1").with("status", "FINISHED").with("text", "hello there");
        s.run_workload(vec![frame], streams, cancel).await.unwrap();

        let history = s.history.lock().unwrap();
        assert_eq!(history.len(), 1); // only the system prompt
    }
}
