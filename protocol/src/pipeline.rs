//! Server-side dispatch pipeline.
//!
//! Every request runs through the same stages, in order:
//!
//! 1. preprocess: parse the envelope (`BadRequest` on failure)
//! 2. integrity: field hashes, then the sender's signature and the receiver
//!    it was signed for (`BadRequest` / `Forbidden`)
//! 3. blacklist (`Forbidden` with the handler's reason)
//! 4. priority: wait for a worker slot, highest priority first
//! 5. forward: the handler, in its own task (`ServerError` on error or panic)
//! 6. postprocess: stamp response hashes and hand the answer to the transport
//!
//! Nothing before stage 5 touches the handler's `forward`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};

use crate::config::ServerConfig;
use crate::envelope::{deadline_after, Envelope, Payload};
use crate::error::{ProtocolError, Result};
use crate::hashing;
use crate::identity::{AcceptAll, SignatureVerifier};
use crate::priority::{GatePermit, PriorityGate};
use crate::streaming::{batch_frames, TokenStream};
use crate::types::{header, Headers, Status, WireRequest, WireResponse};

/// Blacklist decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub reject: bool,
    pub reason: String,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            reject: false,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            reject: true,
            reason: reason.into(),
        }
    }
}

/// What the handler hands back
pub enum Forwarded<P> {
    /// The envelope with its output filled in
    Complete(Envelope<P>),
    /// Output will follow token by token
    Stream(TokenStream),
}

/// Application logic plugged into a pipeline.
#[async_trait]
pub trait Handler<P: Payload>: Send + Sync + 'static {
    async fn forward(&self, envelope: Envelope<P>) -> anyhow::Result<Forwarded<P>>;

    fn blacklist(&self, _envelope: &Envelope<P>) -> Verdict {
        Verdict::allow()
    }

    /// Higher runs first when workers are saturated
    fn priority(&self, _envelope: &Envelope<P>) -> f64 {
        0.0
    }
}

/// Type-erased pipeline, one per message kind
#[async_trait]
pub trait Dispatch: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn dispatch(&self, request: WireRequest) -> WireResponse;
}

pub struct Pipeline<P, H> {
    handler: Arc<H>,
    verifier: Arc<dyn SignatureVerifier>,
    /// Signed requests must name this node as receiver
    bind_receiver: bool,
    gate: PriorityGate,
    config: ServerConfig,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload, H: Handler<P>> Pipeline<P, H> {
    pub fn new(handler: Arc<H>, config: ServerConfig) -> Self {
        Self {
            handler,
            verifier: Arc::new(AcceptAll),
            bind_receiver: false,
            gate: PriorityGate::new(config.max_workers),
            config,
            _payload: PhantomData,
        }
    }

    /// Share worker slots with other pipelines on the same node
    pub fn with_gate(mut self, gate: PriorityGate) -> Self {
        self.gate = gate;
        self
    }

    /// Check signatures, and only accept requests addressed to
    /// `config.identity`
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self.bind_receiver = true;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gate(&self) -> &PriorityGate {
        &self.gate
    }

    /// Run one request through every stage
    pub async fn run(&self, request: WireRequest) -> WireResponse {
        let started = Instant::now();

        let envelope = match self.admit(&request) {
            Ok(envelope) => envelope,
            Err(err) => return self.reject(err, started),
        };

        let priority = self.handler.priority(&envelope);
        let permit = self.gate.acquire(priority).await;

        let deadline = deadline_after(envelope.timeout);
        let request_envelope = envelope.clone();
        let handler = self.handler.clone();
        let task = AbortOnDrop(tokio::spawn(async move { handler.forward(envelope).await }));

        match tokio::time::timeout_at(deadline, task).await {
            Err(_) => self.reject(ProtocolError::Timeout(request_envelope.timeout), started),
            Ok(Err(join_err)) => self.reject(handler_crash(join_err), started),
            Ok(Ok(Err(err))) => {
                tracing::error!(kind = %P::NAME, error = %format!("{err:#}"), "Handler failed");
                self.reject(ProtocolError::HandlerFault(format!("{err:#}")), started)
            }
            Ok(Ok(Ok(Forwarded::Complete(output)))) => {
                drop(permit);
                self.complete(output, started)
            }
            Ok(Ok(Ok(Forwarded::Stream(tokens)))) => {
                self.stream(request_envelope, tokens, deadline, permit, started)
            }
        }
    }

    /// Stages 1-3: nothing here may suspend or touch the handler's forward
    fn admit(&self, request: &WireRequest) -> Result<Envelope<P>> {
        let envelope = Envelope::<P>::from_request(request)?;

        if !envelope.verify() {
            return Err(ProtocolError::IntegrityMismatch(format!(
                "hash check failed for {:?}",
                envelope.payload.required_hash_fields()
            )));
        }

        // The signature covers the receiver, so a request signed for one
        // node can't be replayed to another
        let receiver = envelope.receiver.identity.as_deref().unwrap_or_default();
        if self.bind_receiver && receiver != self.config.identity {
            return Err(ProtocolError::Unverified(format!(
                "request addressed to `{receiver}`, not `{}`",
                self.config.identity
            )));
        }

        let signature = envelope.sender.signature.as_deref().unwrap_or_default();
        let identity = envelope.sender.identity.as_deref().unwrap_or_default();
        if !self
            .verifier
            .verify(signature, &envelope.signing_message(), identity)
        {
            return Err(ProtocolError::Unverified(format!(
                "signature from `{identity}` rejected"
            )));
        }

        let verdict = self.handler.blacklist(&envelope);
        if verdict.reject {
            return Err(ProtocolError::Blacklisted(verdict.reason));
        }

        Ok(envelope)
    }

    fn complete(&self, mut output: Envelope<P>, started: Instant) -> WireResponse {
        self.stamp_receiver(&mut output);
        output.field_hashes =
            hashing::hash_fields(&output.payload, output.payload.response_hash_fields());
        output.process_time = Some(started.elapsed().as_secs_f64());
        output.set_status(Status::Success, "");

        let body = match serde_json::to_vec(&output.payload) {
            Ok(body) => body,
            Err(err) => {
                return self.reject(
                    ProtocolError::HandlerFault(format!("unserializable output: {err}")),
                    started,
                )
            }
        };
        tracing::debug!(
            kind = %P::NAME,
            sender = ?output.sender.identity,
            elapsed = ?started.elapsed(),
            "Request answered"
        );
        WireResponse {
            status: Status::Success,
            headers: output.response_headers(false),
            body: stream::once(async move { Ok(Bytes::from(body)) }).boxed(),
        }
    }

    fn stream(
        &self,
        mut request: Envelope<P>,
        tokens: TokenStream,
        deadline: tokio::time::Instant,
        permit: GatePermit,
        started: Instant,
    ) -> WireResponse {
        self.stamp_receiver(&mut request);
        request.field_hashes.clear();
        request.process_time = Some(started.elapsed().as_secs_f64());
        request.set_status(Status::Success, "");
        let headers = request.response_headers(true);

        let frames = batch_frames(
            tokens,
            request.payload,
            self.config.stream_batch_size,
            deadline,
            Some(permit),
        );
        tracing::debug!(kind = %P::NAME, "Streaming response");
        WireResponse {
            status: Status::Success,
            headers,
            body: frames.map(|frame| Ok(frame.encode())).boxed(),
        }
    }

    fn reject(&self, err: ProtocolError, started: Instant) -> WireResponse {
        let status = err.status();
        match status {
            Status::ServerError => {}
            Status::Timeout => tracing::warn!(kind = %P::NAME, error = %err, "Request timed out"),
            _ => tracing::warn!(kind = %P::NAME, status = %status, error = %err, "Request rejected"),
        }

        let mut headers = Headers::new();
        headers.insert(header::NAME.into(), P::NAME.into());
        headers.insert(header::STATUS.into(), status.code().to_string());
        headers.insert(header::STATUS_MESSAGE.into(), err.to_string());
        headers.insert(
            header::PROCESS_TIME.into(),
            format!("{:.6}", started.elapsed().as_secs_f64()),
        );
        headers.insert(header::STREAMING.into(), "false".into());
        headers.insert(header::RECEIVER_IDENTITY.into(), self.config.identity.clone());
        WireResponse {
            status,
            headers,
            body: stream::empty().boxed(),
        }
    }

    fn stamp_receiver(&self, envelope: &mut Envelope<P>) {
        envelope.receiver.identity = Some(self.config.identity.clone());
        envelope.receiver.address = Some(self.config.external_address.clone());
    }
}

#[async_trait]
impl<P: Payload, H: Handler<P>> Dispatch for Pipeline<P, H> {
    fn kind(&self) -> &'static str {
        P::NAME
    }

    async fn dispatch(&self, request: WireRequest) -> WireResponse {
        self.run(request).await
    }
}

fn handler_crash(err: JoinError) -> ProtocolError {
    if err.is_panic() {
        tracing::error!("Handler panicked");
        ProtocolError::HandlerFault("handler panicked".into())
    } else {
        ProtocolError::HandlerFault("handler cancelled".into())
    }
}

/// Aborts the handler task if the request itself goes away
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
