//! Glint server - websocket orchestrator for realtime voice conversations.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod outbound;
mod state;

use glint_agent::http::{
    HttpLanguageModel, HttpSpeechSynthesis, HttpSpeechToText, LlmConfig, SttConfig, TtsConfig,
};
use glint_core::config::{env_or, env_string_or};
use glint_core::OrchestratorConfig;
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "glint-server",
    about = "Websocket server for realtime voice conversations with screen context",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to (GLINT_HOST, default 0.0.0.0)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on (GLINT_PORT, default 8000)
    #[arg(short, long)]
    port: Option<u16>,
}

/// Bind address from flags, then environment, then defaults, resolved through
/// the same helpers as the rest of the configuration surface.
fn bind_address(args: &ServerArgs) -> String {
    let host = args
        .host
        .clone()
        .unwrap_or_else(|| env_string_or("GLINT_HOST", "0.0.0.0"));
    let port = args.port.unwrap_or_else(|| env_or("GLINT_PORT", 8000));
    format!("{host}:{port}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glint_server=info,glint_agent=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrchestratorConfig::from_env();
    let stt = Arc::new(HttpSpeechToText::new(
        SttConfig::from_env(),
        config.stt_deadline(),
    ));
    let llm = Arc::new(HttpLanguageModel::new(
        LlmConfig::from_env(),
        config.llm_deadline(),
    ));
    let tts = Arc::new(HttpSpeechSynthesis::new(
        TtsConfig::from_env(),
        config.tts_deadline(),
    ));
    let state = AppState::new(config, stt, llm, tts);

    let app = api::create_router(state.clone());

    let addr = bind_address(&args);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("glint server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down");
    }
}
