use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Flat key/value header metadata carried next to every payload
pub type Headers = BTreeMap<String, String>;

/// Header names used on the wire. Everything the protocol reads starts with
/// [`header::PREFIX`]; other transport headers are ignored.
pub mod header {
    pub const PREFIX: &str = "envelope-";

    pub const NAME: &str = "envelope-name";
    pub const TIMEOUT: &str = "envelope-timeout";
    pub const TOTAL_SIZE: &str = "envelope-total-size";
    pub const HEADER_SIZE: &str = "envelope-header-size";

    pub const SENDER_IDENTITY: &str = "envelope-sender-identity";
    pub const SENDER_ADDRESS: &str = "envelope-sender-address";
    pub const SENDER_NONCE: &str = "envelope-sender-nonce";
    pub const SENDER_UUID: &str = "envelope-sender-uuid";
    pub const SENDER_SIGNATURE: &str = "envelope-sender-signature";

    pub const RECEIVER_IDENTITY: &str = "envelope-receiver-identity";
    pub const RECEIVER_ADDRESS: &str = "envelope-receiver-address";

    pub const STATUS: &str = "envelope-status";
    pub const STATUS_MESSAGE: &str = "envelope-status-message";
    pub const PROCESS_TIME: &str = "envelope-process-time";
    pub const STREAMING: &str = "envelope-streaming";

    /// Per-field content hash, e.g. `envelope-hash-messages`
    pub const HASH_PREFIX: &str = "envelope-hash-";
}

/// Outcome of one exchange. Everything except `Unavailable` can be sent by a
/// server; `Unavailable` is attached by the client when no response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    BadRequest,
    Forbidden,
    Timeout,
    ServerError,
    Unavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Success => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::Timeout => 408,
            Status::ServerError => 500,
            Status::Unavailable => 503,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Success),
            400 => Some(Status::BadRequest),
            403 => Some(Status::Forbidden),
            408 => Some(Status::Timeout),
            500 => Some(Status::ServerError),
            503 => Some(Status::Unavailable),
            _ => None,
        }
    }

    /// Map an arbitrary HTTP status (e.g. from a proxy or a body-limit layer)
    /// onto the closed status set.
    pub fn from_http(code: u16) -> Self {
        Self::from_code(code).unwrap_or(match code {
            200..=299 => Status::Success,
            400..=499 => Status::BadRequest,
            _ => Status::ServerError,
        })
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::BadRequest => "bad_request",
            Status::Forbidden => "forbidden",
            Status::Timeout => "timeout",
            Status::ServerError => "server_error",
            Status::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Identity metadata for one end of an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub identity: Option<String>,
    pub address: Option<String>,
    pub nonce: Option<u64>,
    pub uuid: Option<String>,
    pub signature: Option<String>,
}

/// A server to query. The address may be left empty and resolved later
/// through an [`AddressResolver`](crate::identity::AddressResolver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub identity: String,
    pub address: Option<String>,
}

impl Target {
    pub fn new(identity: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: Some(address.into()),
        }
    }

    pub fn unresolved(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: None,
        }
    }
}

impl FromStr for Target {
    type Err = ProtocolError;

    /// Accepts `identity=address` or a bare `address` (which doubles as the identity).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty target".into()));
        }
        match s.split_once('=') {
            Some((identity, address)) if !identity.is_empty() && !address.is_empty() => {
                Ok(Target::new(identity, address))
            }
            Some(_) => Err(ProtocolError::InvalidEnvelope(format!(
                "target `{s}` must look like identity=address"
            ))),
            None => Ok(Target::new(s, s)),
        }
    }
}

/// A request as it travels between client and server
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Message kind, also the route it is posted to
    pub kind: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// A response as it travels back: status and headers up front, then a body
/// that is either one JSON document or a sequence of newline-delimited frames.
pub struct WireResponse {
    pub status: Status,
    pub headers: Headers,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl WireResponse {
    pub fn is_streaming(&self) -> bool {
        self.headers
            .get(header::STREAMING)
            .is_some_and(|v| v == "true")
    }
}

impl fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            Status::Success,
            Status::BadRequest,
            Status::Forbidden,
            Status::Timeout,
            Status::ServerError,
            Status::Unavailable,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_http(413), Status::BadRequest);
        assert_eq!(Status::from_http(502), Status::ServerError);
        assert_eq!(Status::from_http(204), Status::Success);
    }

    #[test]
    fn test_parse_target() {
        let t: Target = "miner-1=127.0.0.1:8091".parse().unwrap();
        assert_eq!(t.identity, "miner-1");
        assert_eq!(t.address.as_deref(), Some("127.0.0.1:8091"));

        let bare: Target = "10.0.0.2:8091".parse().unwrap();
        assert_eq!(bare.identity, "10.0.0.2:8091");

        assert!("=127.0.0.1:1".parse::<Target>().is_err());
        assert!("".parse::<Target>().is_err());
    }
}
