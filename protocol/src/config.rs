use serde::{Deserialize, Serialize};

use crate::envelope::DEFAULT_TIMEOUT_SECS;
use crate::streaming::DEFAULT_BATCH_SIZE;

/// Server-side settings for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity this node answers as
    pub identity: String,
    /// Address other nodes reach us at
    pub external_address: String,
    /// Handler invocations allowed to run at once
    pub max_workers: usize,
    /// Tokens per streamed flush
    pub stream_batch_size: usize,
    /// Tokens a producer may run ahead of the wire
    pub token_buffer: usize,
    /// Largest accepted request body in bytes
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identity: "miner".into(),
            external_address: "127.0.0.1:8091".into(),
            max_workers: 4,
            stream_batch_size: DEFAULT_BATCH_SIZE,
            token_buffer: 64,
            body_limit: 10 * 1024 * 1024,
        }
    }
}

/// Client-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub identity: String,
    pub external_address: Option<String>,
    /// Deadline used when a caller does not pass one
    pub default_timeout: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: "validator".into(),
            external_address: None,
            default_timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}
