//! Conversation store (C8): per-turn persistence of user/assistant
//! text+audio under one directory per conversation. Store access is
//! single-writer — only the STT stage process touches a given
//! conversation's directory.

use crate::codec::{Frame, Value};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One side (user or assistant) of a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnSide {
    pub text: String,
    pub audio_file: Option<String>,
}

/// One turn in `conversation.json`'s ordered list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: usize,
    pub user: TurnSide,
    pub assistant: TurnSide,
}

/// A conversation directory, created when a client connects to the STT
/// stage and destroyed (logically — the directory itself survives unless
/// `DELETE`d) with that connection.
pub struct ConversationStore {
    dir: PathBuf,
    turns: Vec<TurnRecord>,
    pending_assistant_audio: Vec<u8>,
}

impl ConversationStore {
    /// Creates a fresh conversation directory named by the current
    /// timestamp under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(root: &Path, started_at: chrono::DateTime<chrono::Utc>) -> Result<Self> {
        let dir = root.join(started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            turns: Vec::new(),
            pending_assistant_audio: Vec::new(),
        })
    }

    /// The `save_path` attached to frames for turns in this conversation.
    #[must_use]
    pub fn save_path(&self) -> String {
        self.dir.to_string_lossy().into_owned()
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends a new turn with the user's transcript and audio, writing
    /// the user WAV immediately and refreshing `conversation.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAV or manifest cannot be written.
    pub fn append_turn(&mut self, user_text: &str, user_audio: &[u8], audio_config: &Frame) -> Result<()> {
        let n = self.turns.len() + 1;
        let audio_file = format!("user_audio_{n}.wav");
        write_wav(&self.dir.join(&audio_file), user_audio, audio_config)?;
        self.turns.push(TurnRecord {
            turn: n,
            user: TurnSide {
                text: user_text.to_string(),
                audio_file: Some(audio_file),
            },
            assistant: TurnSide::default(),
        });
        self.pending_assistant_audio.clear();
        self.write_manifest()
    }

    /// Grows the last turn's assistant text by one streamed chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if `conversation.json` cannot be rewritten.
    pub fn push_assistant_text(&mut self, chunk: &str) -> Result<()> {
        if let Some(last) = self.turns.last_mut() {
            last.assistant.text.push_str(chunk);
        }
        self.write_manifest()
    }

    /// Buffers one streamed assistant audio chunk. Written to disk only
    /// once [`ConversationStore::finalize_assistant_audio`] runs, since
    /// the WAV header format is only known once, not per chunk.
    pub fn push_assistant_audio(&mut self, chunk: &[u8]) {
        self.pending_assistant_audio.extend_from_slice(chunk);
    }

    /// Writes the buffered assistant audio as a WAV file and refreshes the
    /// manifest. Safe to call even if no audio was buffered (no-op), so
    /// callers can invoke it unconditionally from a `finally`-equivalent
    /// guard regardless of how the forwarding loop exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAV or manifest cannot be written.
    pub fn finalize_assistant_audio(&mut self, audio_config: &Frame) -> Result<()> {
        if self.pending_assistant_audio.is_empty() || self.turns.is_empty() {
            return Ok(());
        }
        let n = self.turns.len();
        let audio_file = format!("assistant_audio_{n}.wav");
        write_wav(&self.dir.join(&audio_file), &self.pending_assistant_audio, audio_config)?;
        if let Some(last) = self.turns.last_mut() {
            last.assistant.audio_file = Some(audio_file);
        }
        self.pending_assistant_audio.clear();
        self.write_manifest()
    }

    fn write_manifest(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.turns)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        std::fs::write(self.dir.join("conversation.json"), json)?;
        Ok(())
    }
}

/// `WRONG {save_path}` — merges `{transcription_error: true}` into the
/// conversation directory's metadata file without touching its audio.
///
/// # Errors
///
/// Returns an error if the metadata file cannot be read or written.
pub fn mark_wrong(save_path: &Path) -> Result<()> {
    let meta_path = save_path.join("metadata.json");
    let mut meta: serde_json::Map<String, serde_json::Value> = if meta_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&meta_path)?)
            .map_err(|e| PipelineError::Store(e.to_string()))?
    } else {
        serde_json::Map::new()
    };
    meta.insert("transcription_error".to_string(), serde_json::Value::Bool(true));
    let content =
        serde_json::to_string_pretty(&meta).map_err(|e| PipelineError::Store(e.to_string()))?;
    std::fs::write(&meta_path, content)?;
    Ok(())
}

/// `DELETE {save_path}` — removes the conversation directory. Non-recursive:
/// a conversation directory never nests subdirectories.
///
/// # Errors
///
/// Returns an error if an entry cannot be removed.
pub fn delete_entry(save_path: &Path) -> Result<()> {
    if !save_path.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(save_path)? {
        std::fs::remove_file(entry?.path())?;
    }
    std::fs::remove_dir(save_path)?;
    Ok(())
}

fn write_wav(path: &Path, audio: &[u8], audio_config: &Frame) -> Result<()> {
    let format = audio_config.get("format").and_then(Value::as_i64).unwrap_or(1);
    let channels = audio_config
        .get("channels")
        .and_then(Value::as_i64)
        .unwrap_or(1)
        .max(1) as u16;
    let rate = audio_config.get("rate").and_then(Value::as_i64).unwrap_or(16_000).max(1) as u32;

    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| PipelineError::Store(e.to_string()))?;

    match format {
        1 => {
            // 32-bit IEEE float -> 16-bit signed PCM.
            for chunk in audio.chunks_exact(4) {
                let sample_f32 = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let clamped = sample_f32.clamp(-1.0, 1.0);
                let sample_i16 = (clamped * f32::from(i16::MAX)) as i16;
                writer
                    .write_sample(sample_i16)
                    .map_err(|e| PipelineError::Store(e.to_string()))?;
            }
        }
        _ => {
            // Already 16-bit signed PCM.
            for chunk in audio.chunks_exact(2) {
                let sample_i16 = i16::from_le_bytes([chunk[0], chunk[1]]);
                writer
                    .write_sample(sample_i16)
                    .map_err(|e| PipelineError::Store(e.to_string()))?;
            }
        }
    }
    writer.finalize().map_err(|e| PipelineError::Store(e.to_string()))?;
    Ok(())
}
