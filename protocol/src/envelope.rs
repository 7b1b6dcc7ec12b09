//! Typed request/response envelopes.
//!
//! An [`Envelope`] carries one [`Payload`] variant plus the header metadata
//! that travels with it. Variants decide which fields are hash-critical and
//! what the caller gets back from [`Payload::deserialize`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::hashing;
use crate::types::{header, Headers, Status, TerminalInfo, WireRequest};

/// Deadline used when the sender does not set one
pub const DEFAULT_TIMEOUT_SECS: f64 = 12.0;

/// Deadline `secs` from now, capped far in the future for absurd values
pub(crate) fn deadline_after(secs: f64) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    let cap = Duration::from_secs(86400 * 365 * 30);
    let budget = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO).min(cap);
    now + budget
}

/// Capability every envelope variant implements.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Message kind on the wire; also the route the envelope is posted to
    const NAME: &'static str;

    /// Whether servers answer this kind with a token stream
    const STREAMING: bool = false;

    /// What the caller gets back after a round trip
    type Output;

    /// Fields stamped by the sender and verified before dispatch
    fn required_hash_fields(&self) -> &'static [&'static str] {
        &["messages"]
    }

    /// Fields stamped by the server over its output
    fn response_hash_fields(&self) -> &'static [&'static str] {
        &["completion"]
    }

    fn deserialize(&self) -> Self::Output;

    /// Rules a received payload must satisfy; serde alone can't express them
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// JSON value of one field, `None` if the payload has no such field
    fn field_value(&self, field: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove(field),
            _ => None,
        }
    }

    /// Reset every server-written field; a request never carries output
    fn clear_output(&mut self);

    /// Copy the server-written fields of `response` into `self`
    fn merge_response(&mut self, response: Self);

    /// Append one streamed chunk to the output
    fn append_chunk(&mut self, chunk: &str);
}

/// Read-only conversation: one role per message, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    roles: Vec<String>,
    messages: Vec<String>,
}

impl Prompt {
    pub fn new(roles: Vec<String>, messages: Vec<String>) -> Result<Self> {
        let prompt = Self { roles, messages };
        prompt.validate()?;
        Ok(prompt)
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// `(role, message)` pairs in order
    pub fn turns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roles
            .iter()
            .map(String::as_str)
            .zip(self.messages.iter().map(String::as_str))
    }

    fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("roles must not be empty".into()));
        }
        if self.messages.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("messages must not be empty".into()));
        }
        if self.roles.len() != self.messages.len() {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "{} roles for {} messages",
                self.roles.len(),
                self.messages.len()
            )));
        }
        Ok(())
    }

    fn field(&self, field: &str) -> Option<Value> {
        match field {
            "roles" => Some(Value::from(self.roles.clone())),
            "messages" => Some(Value::from(self.messages.clone())),
            _ => None,
        }
    }
}

/// Declares a prompt/completion variant: the shared [`Prompt`], a public
/// `completion` output and the [`Payload`] impl around them.
macro_rules! prompt_payload {
    (
        $(#[$meta:meta])*
        $name:ident {
            streaming: $streaming:expr,
            hashes: [$($field:literal),+ $(,)?] $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(flatten)]
            prompt: Prompt,
            #[serde(default)]
            pub completion: String,
        }

        impl $name {
            pub fn new(roles: Vec<String>, messages: Vec<String>) -> Result<Self> {
                Ok(Self {
                    prompt: Prompt::new(roles, messages)?,
                    completion: String::new(),
                })
            }

            pub fn prompt(&self) -> &Prompt {
                &self.prompt
            }

            pub fn roles(&self) -> &[String] {
                self.prompt.roles()
            }

            pub fn messages(&self) -> &[String] {
                self.prompt.messages()
            }
        }

        impl Payload for $name {
            const NAME: &'static str = stringify!($name);
            const STREAMING: bool = $streaming;
            type Output = String;

            fn required_hash_fields(&self) -> &'static [&'static str] {
                &[$($field),+]
            }

            fn deserialize(&self) -> String {
                self.completion.clone()
            }

            fn validate(&self) -> Result<()> {
                self.prompt.validate()
            }

            fn field_value(&self, field: &str) -> Option<Value> {
                match field {
                    "completion" => Some(Value::from(self.completion.clone())),
                    other => self.prompt.field(other),
                }
            }

            fn clear_output(&mut self) {
                self.completion.clear();
            }

            fn merge_response(&mut self, response: Self) {
                self.completion = response.completion;
            }

            fn append_chunk(&mut self, chunk: &str) {
                self.completion.push_str(chunk);
            }
        }
    };
}

prompt_payload! {
    /// Plain prompt/completion exchange. Roles are advisory and not hashed.
    Prompting {
        streaming: false,
        hashes: ["messages"],
    }
}

prompt_payload! {
    /// Streaming variant: the completion arrives as a sequence of chunks.
    StreamPrompting {
        streaming: true,
        hashes: ["messages"],
    }
}

prompt_payload! {
    /// Like [`Prompting`], but roles are hash-critical too.
    StrictPrompting {
        streaming: false,
        hashes: ["roles", "messages"],
    }
}

/// One protocol exchange: a payload plus the metadata that travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<P> {
    pub payload: P,
    /// Deadline in seconds, set by the sender
    pub timeout: f64,
    pub total_size: usize,
    pub header_size: usize,
    pub sender: TerminalInfo,
    pub receiver: TerminalInfo,
    pub field_hashes: BTreeMap<String, String>,
    /// Set by the receiving side; `None` until the exchange has an outcome
    pub status: Option<Status>,
    pub status_message: String,
    pub process_time: Option<f64>,
}

impl<P: Payload> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            timeout: DEFAULT_TIMEOUT_SECS,
            total_size: 0,
            header_size: 0,
            sender: TerminalInfo::default(),
            receiver: TerminalInfo::default(),
            field_hashes: BTreeMap::new(),
            status: None,
            status_message: String::new(),
            process_time: None,
        }
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &'static str {
        P::NAME
    }

    pub fn deserialize(&self) -> P::Output {
        self.payload.deserialize()
    }

    /// Recompute the hashes of the payload's hash-critical fields
    pub fn stamp(&mut self) {
        self.field_hashes = hashing::hash_fields(&self.payload, self.payload.required_hash_fields());
    }

    pub fn verify(&self) -> bool {
        hashing::verify(
            &self.payload,
            self.payload.required_hash_fields(),
            &self.field_hashes,
        )
    }

    pub fn body_hash(&self) -> String {
        hashing::body_hash(&self.field_hashes, self.payload.required_hash_fields())
    }

    /// The message the sender signs: `nonce.sender.receiver.uuid.body_hash`
    pub fn signing_message(&self) -> String {
        format!(
            "{}.{}.{}.{}.{}",
            self.sender.nonce.unwrap_or_default(),
            self.sender.identity.as_deref().unwrap_or_default(),
            self.receiver.identity.as_deref().unwrap_or_default(),
            self.sender.uuid.as_deref().unwrap_or_default(),
            self.body_hash(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(Status::is_success)
    }

    pub fn set_status(&mut self, status: Status, message: impl Into<String>) {
        self.status = Some(status);
        self.status_message = message.into();
    }

    /// Serialize for transmission, recording the wire sizes on `self`.
    pub fn to_request(&mut self) -> Result<WireRequest> {
        let body = serde_json::to_vec(&self.payload)?;

        let mut headers = Headers::new();
        headers.insert(header::NAME.into(), P::NAME.into());
        headers.insert(header::TIMEOUT.into(), self.timeout.to_string());
        put_terminal(&mut headers, &self.sender, Side::Sender);
        put_terminal(&mut headers, &self.receiver, Side::Receiver);
        for (field, digest) in &self.field_hashes {
            headers.insert(format!("{}{field}", header::HASH_PREFIX), digest.clone());
        }

        self.header_size = headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.total_size = self.header_size + body.len();
        headers.insert(header::HEADER_SIZE.into(), self.header_size.to_string());
        headers.insert(header::TOTAL_SIZE.into(), self.total_size.to_string());

        Ok(WireRequest {
            kind: P::NAME.into(),
            headers,
            body: body.into(),
        })
    }

    /// Parse a received request. Fails with `MalformedInput` on anything that
    /// is not a well-formed envelope of kind `P`.
    pub fn from_request(request: &WireRequest) -> Result<Self> {
        if request.kind != P::NAME {
            return Err(ProtocolError::MalformedInput(format!(
                "expected {} but request is {}",
                P::NAME,
                request.kind
            )));
        }
        let headers = &request.headers;
        if let Some(name) = headers.get(header::NAME) {
            if name != P::NAME {
                return Err(ProtocolError::MalformedInput(format!(
                    "header names {name} but route is {}",
                    P::NAME
                )));
            }
        }

        let mut payload: P = serde_json::from_slice(&request.body)?;
        payload
            .validate()
            .map_err(|e| ProtocolError::MalformedInput(e.to_string()))?;
        // Output is written by this side only
        payload.clear_output();

        let timeout = parse_header::<f64>(headers, header::TIMEOUT)?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ProtocolError::MalformedInput(format!("bad timeout {timeout}")));
        }

        let field_hashes = headers
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(header::HASH_PREFIX)
                    .map(|field| (field.to_string(), v.clone()))
            })
            .collect();

        Ok(Self {
            payload,
            timeout,
            total_size: parse_header(headers, header::TOTAL_SIZE)?.unwrap_or(request.body.len()),
            header_size: parse_header(headers, header::HEADER_SIZE)?.unwrap_or_default(),
            sender: TerminalInfo {
                identity: headers.get(header::SENDER_IDENTITY).cloned(),
                address: headers.get(header::SENDER_ADDRESS).cloned(),
                nonce: parse_header(headers, header::SENDER_NONCE)?,
                uuid: headers.get(header::SENDER_UUID).cloned(),
                signature: headers.get(header::SENDER_SIGNATURE).cloned(),
            },
            receiver: TerminalInfo {
                identity: headers.get(header::RECEIVER_IDENTITY).cloned(),
                address: headers.get(header::RECEIVER_ADDRESS).cloned(),
                ..Default::default()
            },
            field_hashes,
            status: None,
            status_message: String::new(),
            process_time: None,
        })
    }

    /// Headers a server sends back with its answer
    pub(crate) fn response_headers(&self, streaming: bool) -> Headers {
        let mut headers = Headers::new();
        headers.insert(header::NAME.into(), P::NAME.into());
        let status = self.status.unwrap_or(Status::Success);
        headers.insert(header::STATUS.into(), status.code().to_string());
        if !self.status_message.is_empty() {
            headers.insert(header::STATUS_MESSAGE.into(), self.status_message.clone());
        }
        if let Some(elapsed) = self.process_time {
            headers.insert(header::PROCESS_TIME.into(), format!("{elapsed:.6}"));
        }
        headers.insert(header::STREAMING.into(), streaming.to_string());
        put_terminal(&mut headers, &self.receiver, Side::Receiver);
        for (field, digest) in &self.field_hashes {
            headers.insert(format!("{}{field}", header::HASH_PREFIX), digest.clone());
        }
        headers
    }

    /// Absorb status and timing from a server's response headers
    pub(crate) fn apply_response_headers(&mut self, status: Status, headers: &Headers) {
        let status = headers
            .get(header::STATUS)
            .and_then(|v| v.parse().ok())
            .and_then(Status::from_code)
            .unwrap_or(status);
        let message = headers.get(header::STATUS_MESSAGE).cloned().unwrap_or_default();
        self.set_status(status, message);
        self.process_time = headers.get(header::PROCESS_TIME).and_then(|v| v.parse().ok());
    }
}

/// Hashes a response carries, keyed by field
pub(crate) fn response_hashes(headers: &Headers) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(header::HASH_PREFIX)
                .map(|field| (field.to_string(), v.clone()))
        })
        .collect()
}

enum Side {
    Sender,
    Receiver,
}

fn put_terminal(headers: &mut Headers, info: &TerminalInfo, side: Side) {
    let (identity, address) = match side {
        Side::Sender => (header::SENDER_IDENTITY, header::SENDER_ADDRESS),
        Side::Receiver => (header::RECEIVER_IDENTITY, header::RECEIVER_ADDRESS),
    };
    if let Some(v) = &info.identity {
        headers.insert(identity.into(), v.clone());
    }
    if let Some(v) = &info.address {
        headers.insert(address.into(), v.clone());
    }
    if let Side::Sender = side {
        if let Some(v) = info.nonce {
            headers.insert(header::SENDER_NONCE.into(), v.to_string());
        }
        if let Some(v) = &info.uuid {
            headers.insert(header::SENDER_UUID.into(), v.clone());
        }
        if let Some(v) = &info.signature {
            headers.insert(header::SENDER_SIGNATURE.into(), v.clone());
        }
    }
}

fn parse_header<T>(headers: &Headers, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    headers
        .get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| ProtocolError::MalformedInput(format!("header {key}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope<Prompting> {
        let payload = Prompting::new(
            vec!["system".into(), "user".into()],
            vec!["You are a helpful assistant.".into(), "Hi, what is the meaning of life?".into()],
        )
        .unwrap();
        Envelope::new(payload)
    }

    #[test]
    fn test_constructor_rules() {
        assert!(Prompting::new(vec![], vec!["x".into()]).is_err());
        assert!(Prompting::new(vec!["user".into()], vec![]).is_err());
        assert!(Prompting::new(vec!["user".into()], vec!["a".into(), "b".into()]).is_err());

        let p = Prompting::new(vec!["user".into()], vec!["a".into()]).unwrap();
        assert!(p.completion.is_empty());
        assert_eq!(p.prompt().turns().collect::<Vec<_>>(), vec![("user", "a")]);
    }

    #[test]
    fn test_deserialize_returns_completion() {
        let mut env = envelope();
        env.payload.completion = "The meaning of life is 42. Deal with it, human.".into();
        assert_eq!(env.deserialize(), "The meaning of life is 42. Deal with it, human.");
    }

    #[test]
    fn test_request_round_trip() {
        let mut env = envelope().with_timeout(3.5);
        env.sender.identity = Some("validator".into());
        env.sender.nonce = Some(17);
        env.sender.uuid = Some("abc".into());
        env.receiver.identity = Some("miner".into());
        env.stamp();

        let request = env.to_request().unwrap();
        assert_eq!(request.kind, "Prompting");
        assert!(request.headers.contains_key("envelope-hash-messages"));
        assert!(env.total_size > env.header_size);

        let parsed = Envelope::<Prompting>::from_request(&request).unwrap();
        assert_eq!(parsed.payload, env.payload);
        assert_eq!(parsed.timeout, 3.5);
        assert_eq!(parsed.sender.nonce, Some(17));
        assert_eq!(parsed.receiver.identity.as_deref(), Some("miner"));
        assert!(parsed.verify());
        assert_eq!(parsed.signing_message(), env.signing_message());
    }

    #[test]
    fn test_malformed_requests() {
        let mut env = envelope();
        env.stamp();
        let good = env.to_request().unwrap();

        let mut wrong_kind = good.clone();
        wrong_kind.kind = "StreamPrompting".into();
        assert!(matches!(
            Envelope::<Prompting>::from_request(&wrong_kind),
            Err(ProtocolError::MalformedInput(_))
        ));

        let mut garbage = good.clone();
        garbage.body = bytes::Bytes::from_static(b"{not json");
        assert!(matches!(
            Envelope::<Prompting>::from_request(&garbage),
            Err(ProtocolError::MalformedInput(_))
        ));

        let mut empty_roles = good.clone();
        empty_roles.body = bytes::Bytes::from_static(br#"{"roles":[],"messages":["x"]}"#);
        assert!(matches!(
            Envelope::<Prompting>::from_request(&empty_roles),
            Err(ProtocolError::MalformedInput(_))
        ));

        let mut bad_timeout = good;
        bad_timeout.headers.insert(header::TIMEOUT.into(), "-1".into());
        assert!(Envelope::<Prompting>::from_request(&bad_timeout).is_err());
    }

    #[test]
    fn test_wire_body_shape() {
        let env = envelope();
        let value = serde_json::to_value(&env.payload).unwrap();
        assert!(value.get("roles").is_some());
        assert!(value.get("messages").is_some());
        assert_eq!(value["completion"], "");
    }

    #[test]
    fn test_sender_completion_is_dropped_on_receipt() {
        let mut env = envelope();
        env.payload.completion = "already answered".into();
        env.stamp();
        let request = env.to_request().unwrap();

        let parsed = Envelope::<Prompting>::from_request(&request).unwrap();
        assert!(parsed.payload.completion.is_empty());
        assert!(parsed.verify());
    }

    #[test]
    fn test_variant_names_and_hash_fields() {
        let strict = StrictPrompting::new(vec!["user".into()], vec!["a".into()]).unwrap();
        assert_eq!(StrictPrompting::NAME, "StrictPrompting");
        assert_eq!(strict.required_hash_fields(), &["roles", "messages"]);
        assert!(!StrictPrompting::STREAMING);

        let streamed = StreamPrompting::new(vec!["user".into()], vec!["a".into()]).unwrap();
        assert_eq!(StreamPrompting::NAME, "StreamPrompting");
        assert_eq!(streamed.required_hash_fields(), &["messages"]);
        assert!(StreamPrompting::STREAMING);
    }

    #[test]
    fn test_merge_only_touches_completion() {
        let mut ours = envelope();
        let mut theirs = Prompting::new(vec!["user".into()], vec!["something else".into()]).unwrap();
        theirs.completion = "answer".into();

        ours.payload.merge_response(theirs);
        assert_eq!(ours.payload.completion, "answer");
        assert_eq!(ours.payload.messages().len(), 2);
    }
}
