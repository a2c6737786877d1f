//! The vocoder external collaborator. The core only requires a blocking
//! callable that turns one sentence of text into a sequence of raw PCM
//! chunks, matching the original prototype's incremental
//! `BaseStreamer`-driven `Generation.blocking_fn`.

use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// A text-to-speech backend. `synthesize` runs on a worker thread via
/// [`crate::executor::ThreadExecutor`]; it must poll `cancel` between
/// chunks and stop early once set.
pub trait Synthesizer: Send + Sync + 'static {
    /// Native output sample rate, in Hz.
    fn sample_rate(&self) -> u32;

    /// # Errors
    ///
    /// Returns [`crate::error::PipelineError::Model`] on a backend failure.
    fn synthesize(
        &self,
        text: &str,
        cancel: &CancellationToken,
        on_chunk: &mut dyn FnMut(Vec<u8>) -> Result<()>,
    ) -> Result<()>;
}

/// Deterministic stand-in: emits one fixed-size chunk of silence (32-bit
/// float zero samples) per word in the input text.
#[derive(Debug, Clone, Copy)]
pub struct StubSynthesizer {
    pub rate: u32,
    pub samples_per_word: usize,
}

impl Default for StubSynthesizer {
    fn default() -> Self {
        Self {
            rate: 24_000,
            samples_per_word: 2_400,
        }
    }
}

impl Synthesizer for StubSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn synthesize(
        &self,
        text: &str,
        cancel: &CancellationToken,
        on_chunk: &mut dyn FnMut(Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let word_count = text.split_whitespace().count().max(1);
        for _ in 0..word_count {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let silence = vec![0u8; self.samples_per_word * 4]; // 4 bytes/sample, f32
            on_chunk(silence)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_emits_one_chunk_per_word() {
        let synth = StubSynthesizer::default();
        let mut chunks = 0;
        let mut sink = |_bytes: Vec<u8>| {
            chunks += 1;
            Ok(())
        };
        synth.synthesize("three little words", &CancellationToken::new(), &mut sink).unwrap();
        assert_eq!(chunks, 3);
    }

    #[test]
    fn cancellation_stops_synthesis_early() {
        let synth = StubSynthesizer::default();
        let token = CancellationToken::new();
        token.cancel();
        let mut chunks = 0;
        let mut sink = |_bytes: Vec<u8>| {
            chunks += 1;
            Ok(())
        };
        synth.synthesize("three little words", &token, &mut sink).unwrap();
        assert_eq!(chunks, 0);
    }
}
