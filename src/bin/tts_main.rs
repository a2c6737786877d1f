//! Entry point for the TTS stage server.

use speechd::config::TtsConfig;
use speechd::server::Server;
use speechd::synthesizer::StubSynthesizer;
use speechd::tts::TtsStage;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args().nth(1).map_or_else(
        || speechd::paths::config_dir().join("tts.toml"),
        PathBuf::from,
    );
    let config = match TtsConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path.display(), "using default tts config");
            TtsConfig::default()
        }
    };

    let stage = TtsStage::new(StubSynthesizer {
        rate: config.sample_rate,
        samples_per_word: 2_400,
    });
    let server = Server::new("tts", config.bind.host.clone(), config.bind.port, stage);
    server.serve_forever().await?;
    Ok(())
}
