use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use prompting_protocol::{
    Envelope, Forwarded, Handler, Prompting, StreamPrompting, TokenStream, Verdict,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Stand-in model: answers with the last message of the conversation,
/// streamed word by word when asked to stream.
#[derive(Debug, Clone)]
pub struct EchoModel {
    pub blacklist: HashSet<String>,
    pub weights: HashMap<String, f64>,
    pub token_delay: Duration,
    pub token_buffer: usize,
}

impl EchoModel {
    fn verdict(&self, sender: Option<&str>) -> Verdict {
        match sender {
            None => Verdict::reject("unidentified sender"),
            Some(id) if self.blacklist.contains(id) => {
                Verdict::reject(format!("{id} is blacklisted"))
            }
            Some(_) => Verdict::allow(),
        }
    }

    fn weight(&self, sender: Option<&str>) -> f64 {
        sender
            .and_then(|id| self.weights.get(id))
            .copied()
            .unwrap_or(0.0)
    }
}

fn answer(messages: &[String]) -> String {
    messages.last().cloned().unwrap_or_default()
}

/// Split into words, each keeping its trailing whitespace
fn words(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Handler<Prompting> for EchoModel {
    async fn forward(&self, mut envelope: Envelope<Prompting>) -> Result<Forwarded<Prompting>> {
        envelope.payload.completion = answer(envelope.payload.messages());
        Ok(Forwarded::Complete(envelope))
    }

    fn blacklist(&self, envelope: &Envelope<Prompting>) -> Verdict {
        self.verdict(envelope.sender.identity.as_deref())
    }

    fn priority(&self, envelope: &Envelope<Prompting>) -> f64 {
        self.weight(envelope.sender.identity.as_deref())
    }
}

#[async_trait]
impl Handler<StreamPrompting> for EchoModel {
    async fn forward(&self, envelope: Envelope<StreamPrompting>) -> Result<Forwarded<StreamPrompting>> {
        let tokens = words(&answer(envelope.payload.messages()));
        let (tx, stream) = TokenStream::channel(self.token_buffer);
        let delay = self.token_delay;
        let sender = envelope.sender.identity.clone().unwrap_or_default();

        tokio::spawn(async move {
            let total = tokens.len();
            for (i, token) in tokens.into_iter().enumerate() {
                if tx.send(token).await.is_err() {
                    tracing::info!(%sender, sent = i, total, "Stream cancelled");
                    return;
                }
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = tx.closed() => {
                            tracing::info!(%sender, sent = i + 1, total, "Stream cancelled");
                            return;
                        }
                    }
                }
            }
        });
        Ok(Forwarded::Stream(stream))
    }

    fn blacklist(&self, envelope: &Envelope<StreamPrompting>) -> Verdict {
        self.verdict(envelope.sender.identity.as_deref())
    }

    fn priority(&self, envelope: &Envelope<StreamPrompting>) -> f64 {
        self.weight(envelope.sender.identity.as_deref())
    }
}

/// Parse `identity=weight`
pub fn parse_weight(raw: &str) -> Result<(String, f64)> {
    let Some((identity, weight)) = raw.split_once('=') else {
        bail!("expected identity=weight, got `{raw}`");
    };
    let weight: f64 = weight
        .trim()
        .parse()
        .with_context(|| format!("bad weight in `{raw}`"))?;
    if !weight.is_finite() {
        bail!("weight must be finite in `{raw}`");
    }
    Ok((identity.trim().to_string(), weight))
}
