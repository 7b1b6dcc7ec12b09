//! Prompt/completion protocol between validators and miners
//!
//! A validator wraps a conversation in an [`Envelope`], stamps integrity
//! hashes over its hash-critical fields and posts it to any number of miners
//! at once. Each miner runs the request through a fixed pipeline before its
//! handler ever sees it, then answers with either one complete response or a
//! stream of small token batches.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────┐  POST /{kind}   ┌──────────────────────────────────────┐
//!  │Validator│────────────────►│ preprocess → integrity → blacklist → │
//!  │ Client  │                 │ priority → handler → postprocess     │
//!  │         │◄────────────────│                 Miner Pipeline       │
//!  └─────────┘  JSON or NDJSON └──────────────────────────────────────┘
//! ```
//!
//! ## Integrity
//! - Sender hashes each required field (SHA3-256 over its parts, in order)
//! - Receiver recomputes before dispatch; missing or wrong hash is a `400`
//! - Server hashes its output the same way, client checks before merging
//!
//! ## Streaming
//! - Handlers hand back a cancellable token channel
//! - Tokens are flushed in batches of 4, then one terminal frame
//! - Client gone or deadline hit closes the channel and stops the producer

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod pipeline;
pub mod priority;
pub mod server;
pub mod streaming;
pub mod types;

pub use client::{Client, HttpTransport, LocalTransport, Transport};
pub use config::{ClientConfig, ServerConfig};
pub use envelope::{Envelope, Payload, Prompt, Prompting, StreamPrompting, StrictPrompting};
pub use error::{ProtocolError, Result};
pub use identity::{AddressResolver, PeerBook, SharedSecret, SignatureVerifier, Signer};
pub use pipeline::{Dispatch, Forwarded, Handler, Pipeline, Verdict};
pub use priority::PriorityGate;
pub use streaming::{TokenSender, TokenStream};
pub use types::*;
