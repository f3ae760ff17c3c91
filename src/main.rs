use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use toolstream_engine::tools::create_default_registry;
use toolstream_engine::Runner;
use toolstream_llm::OpenAiProvider;
use toolstream_server::{load_settings, AppState, ServerConfig};

/// Streaming tool-orchestration server for OpenAI-compatible models.
#[derive(Debug, Parser)]
#[command(name = "toolstream", version)]
struct Cli {
    /// JSON settings file, merged over built-in defaults.
    #[arg(short, long, env = "TOOLSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    host: Option<String>,

    /// Listen port (0 picks a free one).
    #[arg(short, long)]
    port: Option<u16>,

    /// Chat-completions base URL, e.g. http://localhost:11434/v1
    #[arg(long)]
    upstream_url: Option<String>,

    #[arg(short, long)]
    model: Option<String>,

    /// Upper bound on completion rounds per run.
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log one JSON object per line.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut settings, ignored) = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(url) = cli.upstream_url {
        settings.upstream.base_url = url;
    }
    if let Some(model) = cli.model {
        settings.upstream.model = model;
    }
    if let Some(rounds) = cli.max_rounds {
        settings.run.max_rounds = rounds;
    }
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if cli.log_json {
        settings.logging.json = true;
    }
    settings.validate()?;

    toolstream_telemetry::init_telemetry(&settings.telemetry_config()?)?;
    for skipped in &ignored {
        tracing::warn!(key = skipped.key, value = %skipped.value, "invalid env override ignored");
    }

    let provider = OpenAiProvider::new(settings.provider_config())?;
    let registry = Arc::new(create_default_registry());
    let runner = Runner::new(Arc::new(provider), registry, settings.runner_config());

    tracing::info!(
        upstream = %settings.upstream.base_url,
        model = %settings.upstream.model,
        max_rounds = settings.run.max_rounds,
        tools = runner.registry().count(),
        "starting toolstream"
    );

    let state = AppState::new(Arc::new(runner)).with_typing(settings.typing_config());
    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        ..ServerConfig::default()
    };
    let handle = toolstream_server::start(config, state)
        .await
        .with_context(|| format!("failed to bind {}:{}", settings.server.host, settings.server.port))?;

    tracing::info!(port = handle.port, "toolstream ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;

    tracing::info!(active_runs = handle.active_runs(), "shutting down");
    handle.shutdown().await;
    Ok(())
}
