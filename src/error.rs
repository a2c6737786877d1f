//! Error types for the streaming conversational pipeline.

/// Top-level error type for the speech-to-speech system.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A frame could not be decoded: malformed JSON or invalid base64 in a
    /// `_base64`-tagged value.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// The underlying transport closed or errored; the connection is no
    /// longer usable.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A `send` was attempted with an `id` that does not match the
    /// connection's current session id.
    #[error("stream reset: expected id {expected}")]
    StreamReset {
        /// The session id the connection was actually gated to.
        expected: String,
    },

    /// Dialing a downstream stage failed. Never returned to a caller as a
    /// terminal failure — the server scaffold retries indefinitely and only
    /// logs this.
    #[error("downstream dial failed: {0}")]
    DialFailed(String),

    /// A model backend (transcriber, generator, synthesiser) raised an
    /// error from inside its blocking callable.
    #[error("model error: {0}")]
    Model(String),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Conversation store error (WAV or metadata persistence).
    #[error("store error: {0}")]
    Store(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PipelineError>;
