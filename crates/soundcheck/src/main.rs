//! soundcheck server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use liveset::LiveBridge;
use mixchat::AnthropicProvider;
use oscwire::{OscQuery, OscTransport};

use soundcheck::channel::App;
use soundcheck::config::Config;
use soundcheck::prompts;
use soundcheck::sessions::SessionManager;

#[derive(Parser)]
#[command(name = "soundcheck")]
#[command(about = "AI mixing copilot server for a live DAW session")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (default: ./soundcheck.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTP port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.bind.port = port;
    }

    if config.llm.api_key.is_empty() {
        anyhow::bail!("ANTHROPIC_API_KEY is not set; the agent cannot run without it");
    }

    let transport = Arc::new(
        OscTransport::bind(&config.osc_config())
            .await
            .with_context(|| {
                format!("failed to bind local OSC port {}", config.osc.local_port)
            })?,
    );
    let query = Arc::new(OscQuery::new(transport.clone(), config.query_timeout()));
    let bridge = Arc::new(LiveBridge::new(query, config.liveness_timeout()));

    if !bridge.is_live().await {
        anyhow::bail!(
            "DAW is not answering OSC probes at {}:{}; is the remote script loaded?",
            config.osc.remote_host,
            config.osc.remote_port
        );
    }

    let provider = Arc::new(AnthropicProvider::new(config.provider_config()));
    let sessions = SessionManager::new(
        bridge,
        provider,
        config.observer_config(),
        prompts::system_prompt(config.system_prompt.as_deref()),
    );

    let addr = format!("{}:{}", config.bind.host, config.bind.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, model = %config.llm.model, "soundcheck listening");

    let app = Arc::new(App { config, sessions });
    axum::serve(listener, soundcheck::channel::router(app.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    // Unsubscribe parameters best-effort, then drop the socket pair.
    app.sessions.shutdown_all().await;
    transport.shutdown();
    Ok(())
}
