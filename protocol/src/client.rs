//! Client invoker.
//!
//! [`Client::send`] fans one envelope out to many targets at once. Every
//! target gets its own copy, its own deadline and its own outcome; one slow
//! or broken target never holds back the others.

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::ClientConfig;
use crate::envelope::{deadline_after, response_hashes, Envelope, Payload};
use crate::error::{ProtocolError, Result};
use crate::hashing;
use crate::identity::{AddressResolver, Signer};
use crate::pipeline::Dispatch;
use crate::streaming::{FrameDecoder, StreamAssembler};
use crate::types::{header, Headers, Status, Target, TerminalInfo, WireRequest, WireResponse};

/// Carries one request to an address and hands back the response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, address: &str, request: WireRequest) -> Result<WireResponse>;
}

/// `POST http://{address}/{kind}` over reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, address: &str, request: WireRequest) -> Result<WireResponse> {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let url = format!("{base}/{}", request.kind);

        let mut builder = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.send().await?;

        let status = Status::from_http(resp.status().as_u16());
        let headers: Headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(header::PREFIX))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProtocolError::from))
            .boxed();

        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }
}

type LocalRoutes = HashMap<String, Arc<dyn Dispatch>>;

/// In-process transport: addresses map straight to pipelines.
#[derive(Clone, Default)]
pub struct LocalTransport {
    nodes: Arc<RwLock<HashMap<String, LocalRoutes>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        address: impl Into<String>,
        routes: impl IntoIterator<Item = Arc<dyn Dispatch>>,
    ) {
        let routes = routes
            .into_iter()
            .map(|route| (route.kind().to_string(), route))
            .collect();
        self.nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address.into(), routes);
    }

    pub fn remove(&self, address: &str) {
        self.nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(address);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, address: &str, request: WireRequest) -> Result<WireResponse> {
        let route = {
            let nodes = self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            let routes = nodes
                .get(address)
                .ok_or_else(|| ProtocolError::TransportFault(format!("nothing listens on {address}")))?;
            routes.get(&request.kind).cloned()
        };
        match route {
            Some(route) => Ok(route.dispatch(request).await),
            None => Ok(WireResponse {
                status: Status::from_http(404),
                headers: Headers::new(),
                body: stream::empty().boxed(),
            }),
        }
    }
}

/// Sends envelopes and gathers one outcome per target.
pub struct Client {
    transport: Arc<dyn Transport>,
    signer: Option<Arc<dyn Signer>>,
    resolver: Option<Arc<dyn AddressResolver>>,
    config: ClientConfig,
    uuid: String,
    nonce: AtomicU64,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        // Start from wall-clock nanos so nonces keep rising across restarts
        let nonce = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or_default();
        Self {
            transport,
            signer: None,
            resolver: None,
            config,
            uuid: uuid::Uuid::new_v4().to_string(),
            nonce: AtomicU64::new(nonce),
        }
    }

    pub fn http(config: ClientConfig) -> Self {
        Self::new(Arc::new(HttpTransport::new()), config)
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Identity stamped as sender
    pub fn identity(&self) -> &str {
        match &self.signer {
            Some(signer) => signer.identity(),
            None => &self.config.identity,
        }
    }

    /// One envelope per target, in target order
    pub async fn send<P: Payload>(
        &self,
        targets: &[Target],
        envelope: &Envelope<P>,
        timeout: f64,
    ) -> Vec<Envelope<P>> {
        tracing::debug!(kind = %P::NAME, targets = targets.len(), timeout, "Sending");
        join_all(
            targets
                .iter()
                .map(|target| self.call(target, envelope, timeout)),
        )
        .await
    }

    pub async fn call<P: Payload>(
        &self,
        target: &Target,
        envelope: &Envelope<P>,
        timeout: f64,
    ) -> Envelope<P> {
        self.stream(target, envelope, timeout, |_| {}).await
    }

    /// Like [`Client::call`], handing every streamed chunk to `on_chunk` as
    /// it arrives. A complete (non-streamed) answer produces no chunks.
    pub async fn stream<P, F>(
        &self,
        target: &Target,
        envelope: &Envelope<P>,
        timeout: f64,
        mut on_chunk: F,
    ) -> Envelope<P>
    where
        P: Payload,
        F: FnMut(&str) + Send,
    {
        let started = Instant::now();
        let mut outcome = envelope.clone();
        // A reused envelope must not carry an earlier answer into this one
        outcome.payload.clear_output();
        outcome.timeout = timeout;
        outcome.status = None;
        outcome.status_message.clear();
        outcome.process_time = None;

        if !timeout.is_finite() || timeout <= 0.0 {
            let err = ProtocolError::InvalidEnvelope(format!("bad timeout {timeout}"));
            outcome.set_status(err.status(), err.to_string());
            return outcome;
        }

        let deadline = deadline_after(timeout);
        let result =
            tokio::time::timeout_at(deadline, self.exchange(target, &mut outcome, &mut on_chunk))
                .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => outcome.set_status(err.status(), err.to_string()),
            Err(_) => {
                // Whatever streamed in so far stays in the payload
                let err = ProtocolError::Timeout(timeout);
                outcome.set_status(err.status(), err.to_string());
            }
        }
        if outcome.process_time.is_none() || !outcome.is_success() {
            outcome.process_time = Some(started.elapsed().as_secs_f64());
        }

        let status = outcome.status.unwrap_or(Status::ServerError);
        if status.is_success() {
            tracing::debug!(peer = %target.identity, kind = %P::NAME, elapsed = ?started.elapsed(), "Call succeeded");
        } else {
            tracing::info!(
                peer = %target.identity,
                kind = %P::NAME,
                %status,
                reason = %outcome.status_message,
                "Call failed"
            );
        }
        outcome
    }

    async fn exchange<P, F>(
        &self,
        target: &Target,
        envelope: &mut Envelope<P>,
        on_chunk: &mut F,
    ) -> Result<()>
    where
        P: Payload,
        F: FnMut(&str) + Send,
    {
        let (address, resolved) = match &target.address {
            Some(address) => (address.clone(), false),
            None => (self.resolve(&target.identity).await?, true),
        };

        envelope.receiver = TerminalInfo {
            identity: Some(target.identity.clone()),
            address: Some(address.clone()),
            ..Default::default()
        };
        envelope.sender = TerminalInfo {
            identity: Some(self.identity().to_string()),
            address: self.config.external_address.clone(),
            nonce: Some(self.nonce.fetch_add(1, Ordering::Relaxed) + 1),
            uuid: Some(self.uuid.clone()),
            signature: None,
        };
        envelope.stamp();
        if let Some(signer) = &self.signer {
            envelope.sender.signature = Some(signer.sign(&envelope.signing_message()));
        }

        let request = envelope.to_request()?;
        let response = self.transport.send(&address, request).await;
        if resolved {
            if let Some(resolver) = &self.resolver {
                resolver.report(&target.identity, response.is_ok()).await;
            }
        }
        absorb(envelope, response?, on_chunk).await
    }

    async fn resolve(&self, identity: &str) -> Result<String> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| ProtocolError::TransportFault(format!("no address for {identity}")))?;
        resolver
            .resolve(identity)
            .await
            .ok_or_else(|| ProtocolError::TransportFault(format!("no address for {identity}")))
    }
}

/// Fold a response into the caller's envelope
async fn absorb<P, F>(envelope: &mut Envelope<P>, response: WireResponse, on_chunk: &mut F) -> Result<()>
where
    P: Payload,
    F: FnMut(&str) + Send,
{
    let streaming = response.is_streaming();
    let WireResponse {
        status,
        headers,
        mut body,
    } = response;

    envelope.apply_response_headers(status, &headers);
    if !envelope.is_success() {
        return Ok(());
    }

    if !streaming {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let output: P = serde_json::from_slice(&buf)?;
        let hashes = response_hashes(&headers);
        if !hashing::verify(&output, output.response_hash_fields(), &hashes) {
            return Err(ProtocolError::IntegrityMismatch(
                "response does not match its hashes".into(),
            ));
        }
        envelope.payload.merge_response(output);
        return Ok(());
    }

    let mut decoder = FrameDecoder::new();
    let mut assembler = StreamAssembler::new();
    while let Some(chunk) = body.next().await {
        for frame in decoder.push(&chunk?)? {
            let data = frame.data.clone();
            assembler.apply(&mut envelope.payload, frame)?;
            if !data.is_empty() {
                on_chunk(&data);
            }
        }
    }
    decoder.finish()?;

    let trailer = assembler.trailer().cloned().ok_or_else(|| {
        ProtocolError::TransportFault("stream ended without a terminal frame".into())
    })?;
    envelope.set_status(trailer.status, trailer.message);
    if trailer.process_time.is_some() {
        envelope.process_time = trailer.process_time;
    }
    if trailer.status.is_success()
        && !hashing::verify(
            &envelope.payload,
            envelope.payload.response_hash_fields(),
            &trailer.field_hashes,
        )
    {
        return Err(ProtocolError::IntegrityMismatch(
            "streamed output does not match its hashes".into(),
        ));
    }
    Ok(())
}
