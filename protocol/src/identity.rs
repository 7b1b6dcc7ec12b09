//! Identity collaborators.
//!
//! The protocol never manages keys itself. It asks a [`Signer`] to sign the
//! outgoing signing message, a [`SignatureVerifier`] to check incoming ones,
//! and an [`AddressResolver`] to find where an identity listens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

pub trait Signer: Send + Sync {
    fn identity(&self) -> &str;
    fn sign(&self, message: &str) -> String;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signature: &str, message: &str, claimed_identity: &str) -> bool;
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, identity: &str) -> Option<String>;

    /// Outcome of a call to an address this resolver supplied
    async fn report(&self, _identity: &str, _reachable: bool) {}
}

/// Verifier for deployments without an identity layer
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _signature: &str, _message: &str, _claimed_identity: &str) -> bool {
        true
    }
}

/// Network-wide shared token, used both to sign and to verify. Each sender's
/// nonce must strictly increase, which rejects replayed requests.
pub struct SharedSecret {
    identity: String,
    secret: String,
    last_nonce: Mutex<HashMap<String, u64>>,
}

impl SharedSecret {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
            last_nonce: Mutex::new(HashMap::new()),
        }
    }

    fn digest(&self, identity: &str, message: &str) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b".");
        hasher.update(identity.as_bytes());
        hasher.update(b".");
        hasher.update(message.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Signer for SharedSecret {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn sign(&self, message: &str) -> String {
        self.digest(&self.identity, message)
    }
}

impl SignatureVerifier for SharedSecret {
    fn verify(&self, signature: &str, message: &str, claimed_identity: &str) -> bool {
        if self.digest(claimed_identity, message) != signature {
            return false;
        }
        // Signing messages start with the nonce
        let Some(nonce) = message.split('.').next().and_then(|n| n.parse::<u64>().ok()) else {
            return false;
        };
        let mut seen = self
            .last_nonce
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match seen.get(claimed_identity) {
            Some(last) if nonce <= *last => {
                tracing::debug!(identity = %claimed_identity, nonce, last, "Replayed nonce");
                false
            }
            _ => {
                seen.insert(claimed_identity.to_string(), nonce);
                true
            }
        }
    }
}

/// A known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub identity: String,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub failures: u32,
}

impl PeerInfo {
    pub fn is_alive(&self, timeout_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.last_seen);
        age.num_seconds() < timeout_secs as i64
    }
}

/// In-memory identity → address book; fed by whatever membership system
/// the deployment uses.
#[derive(Debug, Clone)]
pub struct PeerBook {
    peers: Arc<RwLock<HashMap<String, PeerInfo>>>,
    peer_timeout_secs: u64,
    /// Consecutive failures after which a peer stops resolving
    max_failures: u32,
}

impl PeerBook {
    pub fn new(peer_timeout_secs: u64) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            peer_timeout_secs,
            max_failures: 3,
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    fn usable(&self, peer: &PeerInfo) -> bool {
        peer.is_alive(self.peer_timeout_secs) && peer.failures < self.max_failures
    }

    /// Add or update a peer's address
    pub async fn insert(&self, identity: impl Into<String>, address: impl Into<String>) {
        let identity = identity.into();
        let address = address.into();
        let mut peers = self.peers.write().await;
        match peers.get_mut(&identity) {
            Some(peer) => {
                peer.address = address;
                peer.last_seen = Utc::now();
                peer.failures = 0;
            }
            None => {
                tracing::info!(peer = %identity, addr = %address, "Added peer");
                peers.insert(
                    identity.clone(),
                    PeerInfo {
                        identity,
                        address,
                        last_seen: Utc::now(),
                        failures: 0,
                    },
                );
            }
        }
    }

    /// Mark a peer as seen
    pub async fn touch(&self, identity: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(identity) {
            peer.last_seen = Utc::now();
            peer.failures = 0;
        }
    }

    pub async fn record_failure(&self, identity: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(identity) {
            peer.failures += 1;
            if peer.failures == self.max_failures {
                tracing::warn!(peer = %identity, failures = peer.failures, "Peer unreachable, skipping");
            }
        }
    }

    /// Remove peers not seen within the timeout
    pub async fn prune_dead(&self) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|id, peer| {
            let alive = peer.is_alive(self.peer_timeout_secs);
            if !alive {
                tracing::info!(peer = %id, "Peer timed out, removing");
            }
            alive
        });
        before - peers.len()
    }

    pub async fn alive_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| self.usable(p))
            .cloned()
            .collect()
    }

    /// Pick up to `n` random alive peers
    pub async fn random_peers(&self, n: usize) -> Vec<PeerInfo> {
        use rand::seq::SliceRandom;
        let mut alive = self.alive_peers().await;
        if alive.len() <= n {
            return alive;
        }
        alive.shuffle(&mut rand::thread_rng());
        alive.truncate(n);
        alive
    }

    pub async fn get(&self, identity: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(identity).cloned()
    }

    pub async fn count(&self) -> usize {
        self.alive_peers().await.len()
    }
}

#[async_trait]
impl AddressResolver for PeerBook {
    async fn resolve(&self, identity: &str) -> Option<String> {
        self.get(identity)
            .await
            .filter(|p| self.usable(p))
            .map(|p| p.address)
    }

    async fn report(&self, identity: &str, reachable: bool) {
        if reachable {
            self.touch(identity).await;
        } else {
            self.record_failure(identity).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_sign_verify() {
        let validator = SharedSecret::new("validator", "s3cret");
        let miner = SharedSecret::new("miner", "s3cret");

        let message = "100.validator.miner.uuid.bodyhash";
        let signature = validator.sign(message);
        assert!(miner.verify(&signature, message, "validator"));
        // Claiming somebody else's identity
        assert!(!miner.verify(&signature, "101.validator.miner.uuid.bodyhash", "intruder"));
    }

    #[test]
    fn test_shared_secret_rejects_replay() {
        let validator = SharedSecret::new("validator", "s3cret");
        let miner = SharedSecret::new("miner", "s3cret");

        let first = "5.validator.miner.u1.h";
        let sig = validator.sign(first);
        assert!(miner.verify(&sig, first, "validator"));
        assert!(!miner.verify(&sig, first, "validator"));

        let older = "4.validator.miner.u2.h";
        assert!(!miner.verify(&validator.sign(older), older, "validator"));

        let newer = "6.validator.miner.u3.h";
        assert!(miner.verify(&validator.sign(newer), newer, "validator"));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let validator = SharedSecret::new("validator", "one");
        let miner = SharedSecret::new("miner", "two");
        let message = "1.validator.miner.u.h";
        assert!(!miner.verify(&validator.sign(message), message, "validator"));
    }

    #[tokio::test]
    async fn test_peer_book_resolves() {
        let book = PeerBook::new(120);
        book.insert("miner-1", "127.0.0.1:8091").await;
        book.insert("miner-2", "127.0.0.1:8092").await;
        book.insert("miner-1", "127.0.0.1:9091").await;

        assert_eq!(book.resolve("miner-1").await.as_deref(), Some("127.0.0.1:9091"));
        assert_eq!(book.resolve("nobody").await, None);
        assert_eq!(book.count().await, 2);
        assert_eq!(book.random_peers(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_peer_stops_resolving() {
        let book = PeerBook::new(120).with_max_failures(2);
        book.insert("miner-1", "127.0.0.1:8091").await;
        book.insert("miner-2", "127.0.0.1:8092").await;

        book.report("miner-1", false).await;
        book.report("miner-1", true).await;
        book.report("miner-1", false).await;
        assert_eq!(book.get("miner-1").await.unwrap().failures, 1);
        assert!(book.resolve("miner-1").await.is_some());

        book.report("miner-1", false).await;
        assert_eq!(book.resolve("miner-1").await, None);
        assert_eq!(book.count().await, 1);

        // Re-announcing resets the count
        book.insert("miner-1", "127.0.0.1:9091").await;
        assert_eq!(book.resolve("miner-1").await.as_deref(), Some("127.0.0.1:9091"));
    }

    #[tokio::test]
    async fn test_peer_book_prunes_stale() {
        let book = PeerBook::new(0);
        book.insert("miner-1", "127.0.0.1:8091").await;
        assert_eq!(book.resolve("miner-1").await, None);
        assert_eq!(book.prune_dead().await, 1);
        assert!(book.get("miner-1").await.is_none());
    }
}
