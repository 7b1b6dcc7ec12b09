mod handler;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use clap::Parser;
use prompting_protocol::{
    server, Dispatch, Pipeline, PriorityGate, Prompting, ServerConfig, SharedSecret,
    SignatureVerifier, StreamPrompting,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use handler::EchoModel;

#[derive(Parser)]
#[command(name = "prompting-miner", about = "Answers prompt envelopes from validators")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "8091", env = "MINER_PORT")]
    port: u16,

    /// Identity this miner answers as
    #[arg(long, default_value = "miner", env = "MINER_IDENTITY")]
    identity: String,

    /// Address validators reach this miner at (defaults to 127.0.0.1:<port>)
    #[arg(long, env = "MINER_EXTERNAL_ADDRESS")]
    external_address: Option<String>,

    /// Shared network secret; when set, unsigned or replayed requests are refused
    #[arg(long, env = "MINER_SECRET")]
    secret: Option<String>,

    /// Requests handled at once
    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Tokens per streamed flush
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Sender identities to refuse (repeatable)
    #[arg(long)]
    blacklist: Vec<String>,

    /// Sender priority as identity=weight (repeatable)
    #[arg(long, value_parser = handler::parse_weight)]
    priority: Vec<(String, f64)>,

    /// Pause between streamed tokens
    #[arg(long, default_value = "0")]
    token_delay_ms: u64,
}

struct HealthState {
    identity: String,
    started_at: DateTime<Utc>,
    gate: PriorityGate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = ServerConfig {
        identity: cli.identity.clone(),
        external_address: cli
            .external_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", cli.port)),
        max_workers: cli.max_workers,
        stream_batch_size: cli.batch_size,
        ..ServerConfig::default()
    };
    tracing::info!(
        identity = %cfg.identity,
        port = cli.port,
        max_workers = cfg.max_workers,
        batch_size = cfg.stream_batch_size,
        signed = cli.secret.is_some(),
        "Starting miner"
    );

    let model = Arc::new(EchoModel {
        blacklist: cli.blacklist.into_iter().collect(),
        weights: cli.priority.into_iter().collect(),
        token_delay: Duration::from_millis(cli.token_delay_ms),
        token_buffer: cfg.token_buffer,
    });

    // Both kinds share the same worker slots
    let gate = PriorityGate::new(cfg.max_workers);
    let mut prompting = Pipeline::<Prompting, _>::new(model.clone(), cfg.clone()).with_gate(gate.clone());
    let mut streaming = Pipeline::<StreamPrompting, _>::new(model, cfg.clone()).with_gate(gate.clone());
    if let Some(secret) = &cli.secret {
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(SharedSecret::new(cfg.identity.clone(), secret.clone()));
        prompting = prompting.with_verifier(verifier.clone());
        streaming = streaming.with_verifier(verifier);
    }

    let routes: Vec<Arc<dyn Dispatch>> = vec![Arc::new(prompting), Arc::new(streaming)];
    let health = Router::new()
        .route("/health", get(health_handler))
        .with_state(Arc::new(HealthState {
            identity: cfg.identity.clone(),
            started_at: Utc::now(),
            gate,
        }));
    let app = server::create_router(routes, cfg.body_limit)
        .merge(health)
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {addr}");

    server::serve(listener, app, server::shutdown_signal()).await?;

    tracing::info!("Miner shut down");
    Ok(())
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    let uptime = Utc::now() - state.started_at;
    let slots = state.gate.slots();
    Json(json!({
        "identity": state.identity,
        "uptime_secs": uptime.num_seconds(),
        "in_flight": slots - state.gate.available(),
        "queued": state.gate.pending(),
        "max_workers": slots,
    }))
}
