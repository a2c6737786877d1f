//! The speech-recognition external collaborator. The core only requires a
//! blocking callable that turns one turn's concatenated audio into text;
//! concrete model loading is out of scope (see spec §1).

use crate::codec::Frame;
use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// A transcription backend. `transcribe` runs on a worker thread via
/// [`crate::executor::ThreadExecutor`]; it should poll `cancel` if the
/// underlying model supports interruption mid-inference.
pub trait Transcriber: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`crate::error::PipelineError::Model`] on a backend failure.
    fn transcribe(
        &self,
        audio: &[u8],
        audio_config: &Frame,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Deterministic stand-in used by default and by tests: reports the byte
/// count it was handed rather than performing any real recognition.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubTranscriber;

impl Transcriber for StubTranscriber {
    fn transcribe(
        &self,
        audio: &[u8],
        _audio_config: &Frame,
        _language: &str,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        Ok(format!("[stub transcription of {} audio bytes]", audio.len()))
    }
}
