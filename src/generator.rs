//! The chat-model external collaborator. The core only requires a
//! blocking callable that streams generated text pieces onto a sink and
//! observes a cancellation token at each piece boundary, matching the
//! `BaseStreamer`/`on_finalized_text` callback shape of the original
//! prototype's `Streamer(TextStreamer)`.

use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Callback invoked once per generated piece. Returning `Err` aborts
/// generation (mirrors a `StreamReset` raised from inside the callback).
pub type TokenSink<'a> = dyn FnMut(&str, bool) -> Result<()> + Send + 'a;

/// A chat-completion backend. `generate` runs on a worker thread via
/// [`crate::executor::ThreadExecutor`]; it must poll `cancel` at each
/// piece boundary and stop (returning whatever text was produced so far
/// is not required — the caller discards it on cancellation) once set.
pub trait TextGenerator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`crate::error::PipelineError::Model`] on a backend failure.
    fn generate(
        &self,
        history: &[HistoryTurn],
        cancel: &CancellationToken,
        on_piece: &mut TokenSink<'_>,
    ) -> Result<()>;
}

/// Deterministic stand-in: echoes a short canned reply back one word at a
/// time, checking cancellation between words.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubTextGenerator;

impl TextGenerator for StubTextGenerator {
    fn generate(
        &self,
        history: &[HistoryTurn],
        cancel: &CancellationToken,
        on_piece: &mut TokenSink<'_>,
    ) -> Result<()> {
        let last_user_text = history
            .iter()
            .rev()
            .find(|turn| turn.role == "user")
            .map_or("that", |turn| turn.content.as_str());
        let reply = format!("I heard you say: {last_user_text}.");
        let words: Vec<&str> = reply.split_whitespace().collect();
        for (idx, word) in words.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let is_final = idx + 1 == words.len();
            let piece = if is_final { word.to_string() } else { format!("{word} ") };
            on_piece(&piece, is_final)?;
        }
        Ok(())
    }
}
