use anyhow::{bail, Result};
use clap::Parser;
use prompting_protocol::{
    Client, ClientConfig, Envelope, PeerBook, Payload, Prompting, SharedSecret, StreamPrompting,
    Target,
};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prompting-validator", about = "Queries miners with a prompt and collects completions")]
struct Cli {
    /// Miner as identity=address (repeatable)
    #[arg(long = "target", required = true)]
    targets: Vec<Target>,

    /// Role of each message, in order (repeatable)
    #[arg(long = "role", required = true)]
    roles: Vec<String>,

    /// Conversation messages, in order (repeatable)
    #[arg(long = "message", required = true)]
    messages: Vec<String>,

    /// Ask for a streamed completion
    #[arg(long, default_value = "false")]
    stream: bool,

    /// Per-miner deadline in seconds
    #[arg(long, default_value = "12")]
    timeout: f64,

    /// Identity this validator signs as
    #[arg(long, default_value = "validator", env = "VALIDATOR_IDENTITY")]
    identity: String,

    /// Shared network secret used to sign requests
    #[arg(long, env = "VALIDATOR_SECRET")]
    secret: Option<String>,

    /// Query only this many randomly chosen targets
    #[arg(long)]
    sample: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if cli.roles.len() != cli.messages.len() {
        bail!(
            "{} roles given for {} messages; pass one --role per --message",
            cli.roles.len(),
            cli.messages.len()
        );
    }

    let cfg = ClientConfig {
        identity: cli.identity.clone(),
        default_timeout: cli.timeout,
        ..ClientConfig::default()
    };

    // Every target goes through the book, so `--sample` can pick among them
    let book = Arc::new(PeerBook::new(86400));
    for target in &cli.targets {
        match &target.address {
            Some(address) => book.insert(target.identity.clone(), address.clone()).await,
            None => tracing::warn!(target_id = %target.identity, "Target has no address"),
        }
    }
    let targets: Vec<Target> = match cli.sample {
        Some(n) => book
            .random_peers(n)
            .await
            .into_iter()
            .map(|peer| Target::unresolved(peer.identity))
            .collect(),
        None => cli.targets.iter().map(|t| Target::unresolved(t.identity.clone())).collect(),
    };

    let mut client = Client::http(cfg).with_resolver(book);
    if let Some(secret) = &cli.secret {
        client = client.with_signer(Arc::new(SharedSecret::new(cli.identity.clone(), secret.clone())));
    }

    tracing::info!(
        targets = targets.len(),
        stream = cli.stream,
        timeout = cli.timeout,
        "Querying miners"
    );
    let started = Instant::now();
    if cli.stream {
        let envelope = Envelope::new(StreamPrompting::new(cli.roles, cli.messages)?);
        let results = client.send(&targets, &envelope, client.config().default_timeout).await;
        report(&targets, &results);
    } else {
        let envelope = Envelope::new(Prompting::new(cli.roles, cli.messages)?);
        let results = client.send(&targets, &envelope, client.config().default_timeout).await;
        report(&targets, &results);
    }
    tracing::info!(elapsed = ?started.elapsed(), "Done");
    Ok(())
}

fn report<P>(targets: &[Target], results: &[Envelope<P>])
where
    P: Payload<Output = String>,
{
    for (target, result) in targets.iter().zip(results) {
        let status = result
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into());
        let elapsed = result.process_time.unwrap_or_default();
        if result.is_success() {
            println!("{:<16} {:<12} {:>7.3}s  {}", target.identity, status, elapsed, result.deserialize());
        } else {
            println!(
                "{:<16} {:<12} {:>7.3}s  {} (partial: {:?})",
                target.identity,
                status,
                elapsed,
                result.status_message,
                result.deserialize()
            );
        }
    }
}
