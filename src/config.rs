//! Configuration types for the stage servers (STT, LLM, TTS).
//!
//! Each stage loads its own TOML file into a typed config struct with
//! `#[serde(default)]` so partial files are valid, and an explicit
//! [`Default`] impl documenting the defaults. All three share the bind
//! address and downstream-URI shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Host/port a stage server binds its client-facing listener to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Bind host, e.g. `"0.0.0.0"`.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Speech-to-text stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Client-facing listener.
    pub bind: BindConfig,
    /// Downstream stream key -> WebSocket URI (e.g. `"chat" -> "ws://llm:8001"`).
    pub downstream: HashMap<String, String>,
    /// Path to the transcription model on disk.
    pub model_path: PathBuf,
    /// BCP-47-ish language code passed to the transcriber.
    pub language: String,
    /// Root directory the conversation store writes turns under.
    pub store_root: PathBuf,
}

impl Default for SttConfig {
    fn default() -> Self {
        let mut downstream = HashMap::new();
        downstream.insert("chat".to_string(), "ws://127.0.0.1:8001".to_string());
        Self {
            bind: BindConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            downstream,
            model_path: PathBuf::from("./models/stt"),
            language: "en".to_string(),
            store_root: crate::paths::default_store_root(),
        }
    }
}

/// LLM (chat) stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Client-facing listener (the upstream STT stage dials this).
    pub bind: BindConfig,
    /// Downstream stream key -> WebSocket URI (typically just `"tts"`).
    pub downstream: HashMap<String, String>,
    /// Path to the chat model on disk.
    pub model_path: PathBuf,
    /// BCP-47-ish language code, informational (passed through to prompts).
    pub language: String,
    /// System prompt prepended to history. Empty means no system turn.
    pub system_prompt: String,
    /// Maximum number of turns kept in history before the oldest are dropped.
    /// `0` means unbounded.
    pub history_cap: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut downstream = HashMap::new();
        downstream.insert("tts".to_string(), "ws://127.0.0.1:8002".to_string());
        Self {
            bind: BindConfig {
                host: "0.0.0.0".to_string(),
                port: 8001,
            },
            downstream,
            model_path: PathBuf::from("./models/chat"),
            language: "en".to_string(),
            system_prompt: "You are a helpful voice assistant. Keep replies concise, \
                like in a real conversation."
                .to_string(),
            history_cap: 0,
        }
    }
}

/// Text-to-speech stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Client-facing listener (the upstream LLM stage dials this).
    pub bind: BindConfig,
    /// Downstream stream key -> WebSocket URI. Empty for a terminal stage.
    pub downstream: HashMap<String, String>,
    /// Path to the vocoder/synthesiser model on disk.
    pub model_path: PathBuf,
    /// BCP-47-ish language code passed to the synthesiser.
    pub language: String,
    /// Native output sample rate of the synthesiser, in Hz.
    pub sample_rate: u32,
    /// Voice/speaker identifier passed to the synthesiser.
    pub voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            bind: BindConfig {
                host: "0.0.0.0".to_string(),
                port: 8002,
            },
            downstream: HashMap::new(),
            model_path: PathBuf::from("./models/tts"),
            language: "en".to_string(),
            sample_rate: 24_000,
            voice: "default".to_string(),
        }
    }
}

macro_rules! impl_file_io {
    ($ty:ty) => {
        impl $ty {
            /// Load configuration from a TOML file, falling back to defaults
            /// for missing fields.
            ///
            /// # Errors
            ///
            /// Returns an error if the file cannot be read or parsed.
            pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content).map_err(|e| crate::error::PipelineError::Config(e.to_string()))
            }

            /// Save configuration to a TOML file, creating parent directories
            /// as needed.
            ///
            /// # Errors
            ///
            /// Returns an error if the file cannot be written or the config
            /// cannot be serialized.
            pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let content = toml::to_string_pretty(self)
                    .map_err(|e| crate::error::PipelineError::Config(e.to_string()))?;
                std::fs::write(path, content)?;
                Ok(())
            }
        }
    };
}

impl_file_io!(SttConfig);
impl_file_io!(LlmConfig);
impl_file_io!(TtsConfig);
