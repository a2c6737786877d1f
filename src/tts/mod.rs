//! TTS stage (C7): the terminal hop. Buffers generated text until it has
//! enough of a sentence to speak — the first `FINISHED` frame, or more than
//! four words with a sentence-ending period somewhere in the accumulated
//! text, whichever comes first — then synthesizes that slice and forwards
//! each newly-produced audio chunk to the client as soon as it's ready.
//!
//! The cutoff thresholds (`> 4` words, a literal `.` followed by whitespace
//! or end-of-string) are carried over unchanged from the original
//! prototype's heuristic rather than tuned; see the design notes for why.

use crate::codec::Frame;
use crate::error::Result;
use crate::executor::ThreadExecutor;
use crate::server::{Stage, Streams};
use crate::synthesizer::Synthesizer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct TtsStage<S: Synthesizer> {
    synthesizer: Arc<S>,
}

impl<S: Synthesizer> TtsStage<S> {
    #[must_use]
    pub fn new(synthesizer: S) -> Self {
        Self {
            synthesizer: Arc::new(synthesizer),
        }
    }
}

/// Matches the original prototype's `r"(\.(?:\s|\Z))"`: a period that is
/// either followed by whitespace or sits at the end of the string.
fn has_sentence_end(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        b == b'.' && bytes.get(i + 1).is_none_or(|next| next.is_ascii_whitespace())
    })
}

#[async_trait]
impl<S: Synthesizer> Stage for TtsStage<S> {
    fn downstream_uris(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn cutoff_index(&self, buffered: &[Frame]) -> usize {
        let mut concatenated = String::new();
        for (i, frame) in buffered.iter().enumerate() {
            if let Some(text) = frame.text() {
                concatenated.push_str(text);
            }
            if frame.status() == Some("FINISHED") {
                return i + 1;
            }
            if concatenated.split_whitespace().count() > 4 && has_sentence_end(&concatenated) {
                return i + 1;
            }
        }
        0
    }

    async fn run_workload(&self, prefix: Vec<Frame>, streams: Streams, cancel: CancellationToken) -> Result<()> {
        let Some(first) = prefix.first() else {
            return Ok(());
        };
        let id = first.id().unwrap_or_default().to_string();

        let mut text = String::new();
        let mut last_finished = false;
        for frame in &prefix {
            if let Some(chunk) = frame.text() {
                text.push_str(chunk);
            }
            last_finished = frame.status() == Some("FINISHED");
        }

        let client = streams.get("client").expect("client stream always present").clone();
        let synthesizer = self.synthesizer.clone();
        let sample_rate = i64::from(self.synthesizer.sample_rate());
        let audio_config = Frame::new().with("format", 1i64).with("channels", 1i64).with("rate", sample_rate);

        let id_for_chunks = id.clone();
        let mut executor = ThreadExecutor::new();
        executor
            .run_linked(&cancel, move |cancel| {
                let mut on_chunk = |chunk: Vec<u8>| -> Result<()> {
                    if chunk.is_empty() {
                        return Ok(());
                    }
                    client.send(
                        Frame::new()
                            .with("id", id_for_chunks.as_str())
                            .with("status", "GENERATING")
                            .with("audio", chunk)
                            .with("audio_config", audio_config.clone()),
                    )
                };
                synthesizer.synthesize(&text, &cancel, &mut on_chunk)
            })
            .await?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        if last_finished {
            let client = streams.get("client").expect("client stream always present");
            client.send(
                Frame::new().with("id", id.as_str()).with("status", "FINISHED").with("audio", Vec::<u8>::new()),
            )?;
        }
        Ok(())
    }
}
