//! Entry point for the STT stage server.

use speechd::config::SttConfig;
use speechd::server::Server;
use speechd::stt::SttStage;
use speechd::transcriber::StubTranscriber;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args().nth(1).map_or_else(
        || speechd::paths::config_dir().join("stt.toml"),
        PathBuf::from,
    );
    let config = match SttConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path.display(), "using default stt config");
            SttConfig::default()
        }
    };

    let stage = SttStage::new(
        StubTranscriber,
        config.downstream.clone(),
        config.store_root.clone(),
        config.language.clone(),
    );
    let server = Server::new("stt", config.bind.host.clone(), config.bind.port, stage);
    server.serve_forever().await?;
    Ok(())
}
