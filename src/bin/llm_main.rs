//! Entry point for the LLM stage server.

use speechd::config::LlmConfig;
use speechd::generator::StubTextGenerator;
use speechd::llm::LlmStage;
use speechd::server::Server;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args().nth(1).map_or_else(
        || speechd::paths::config_dir().join("llm.toml"),
        PathBuf::from,
    );
    let config = match LlmConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path.display(), "using default llm config");
            LlmConfig::default()
        }
    };

    let stage = LlmStage::new(
        StubTextGenerator,
        config.downstream.clone(),
        config.system_prompt.clone(),
        config.history_cap,
    );
    let server = Server::new("llm", config.bind.host.clone(), config.bind.port, stage);
    server.serve_forever().await?;
    Ok(())
}
