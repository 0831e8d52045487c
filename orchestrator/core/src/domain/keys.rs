// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Daemon Key Material
//!
//! Types for the daemon's long-lived identity: one X25519 key-agreement pair and
//! one Ed25519 signing pair, addressed by a random [`KeyId`].
//!
//! ## Lifecycle
//!
//! ```text
//! first run ── generate ──▶ active ── rotate ──▶ retired (grace period) ── prune ──▶ gone
//! ```
//!
//! Private halves live in [`SecretBytes`], which pins the buffer in RAM where the
//! OS allows it and zeroes it on drop. The [`TrustStore`] trait is the lookup
//! seam used by the command dispatcher; the file-backed implementation lives in
//! [`crate::infrastructure::key_store`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

/// Number of random bytes behind a key id (hex encoded to 64 chars).
pub const KEY_ID_LEN: usize = 32;

/// Length of the hex fingerprint shown to operators.
const FINGERPRINT_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum KeyError {
    /// The OS entropy source failed. Treated as process-fatal by the daemon.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
    #[error("key not found: {0}")]
    NotFound(KeyId),
    #[error("key {0} was retired and its grace period has elapsed")]
    Retired(KeyId),
    #[error("key storage error: {0}")]
    Storage(String),
    #[error("key store is corrupt: {0}")]
    Corrupt(String),
    #[error("unknown peer identity: {0}")]
    UnknownPeer(String),
}

/// Random, fixed-length, hex-encoded identifier selecting one daemon [`KeyPair`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn from_bytes(bytes: &[u8; KEY_ID_LEN]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Parse an id received on the wire. Only well-formed ids are accepted so a
    /// malformed id never reaches the store.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == KEY_ID_LEN * 2 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 32-byte private key buffer that is locked in memory and wiped on drop.
///
/// The bytes are boxed so the locked address stays stable for the lifetime of
/// the value.
pub struct SecretBytes {
    bytes: Box<[u8; 32]>,
    locked: bool,
}

impl SecretBytes {
    pub fn new(mut raw: [u8; 32]) -> Self {
        let mut bytes = Box::new(raw);
        raw.zeroize();
        let locked = lock_memory(bytes.as_mut_ptr(), bytes.len());
        Self { bytes, locked }
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Whether the OS accepted the page lock (RLIMIT_MEMLOCK can refuse it).
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.bytes[..].zeroize();
        if self.locked {
            unlock_memory(self.bytes.as_mut_ptr(), self.bytes.len());
        }
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(<redacted>)")
    }
}

#[cfg(unix)]
fn lock_memory(ptr: *mut u8, len: usize) -> bool {
    // SAFETY: ptr/len describe a live heap allocation owned by the caller.
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn unlock_memory(ptr: *mut u8, len: usize) {
    // SAFETY: same allocation that was passed to mlock.
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn lock_memory(_ptr: *mut u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_memory(_ptr: *mut u8, _len: usize) {}

/// One daemon identity: X25519 for key agreement, Ed25519 for signing.
#[derive(Debug)]
pub struct KeyPair {
    pub key_id: KeyId,
    pub ecdh_private: SecretBytes,
    pub ecdh_public: [u8; 32],
    pub sign_private: SecretBytes,
    pub sign_public: [u8; 32],
    pub created_at: DateTime<Utc>,
}

impl KeyPair {
    pub fn ecdh_fingerprint(&self) -> String {
        fingerprint(&self.ecdh_public)
    }

    pub fn sign_fingerprint(&self) -> String {
        fingerprint(&self.sign_public)
    }
}

/// A provisioned peer (typically a CLI operator) whose Ed25519 key is trusted
/// to sign envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    #[serde(with = "hex_key")]
    pub signing_public: [u8; 32],
    pub added_at: DateTime<Utc>,
}

impl PeerIdentity {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.signing_public)
    }
}

/// Public view of the active key, safe to hand to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub key_id: KeyId,
    pub ecdh_public: String,
    pub sign_public: String,
    pub ecdh_fingerprint: String,
    pub sign_fingerprint: String,
}

impl From<&KeyPair> for PublicIdentity {
    fn from(pair: &KeyPair) -> Self {
        Self {
            key_id: pair.key_id.clone(),
            ecdh_public: hex::encode(pair.ecdh_public),
            sign_public: hex::encode(pair.sign_public),
            ecdh_fingerprint: pair.ecdh_fingerprint(),
            sign_fingerprint: pair.sign_fingerprint(),
        }
    }
}

/// SHA-256 of the public key truncated to 8 bytes, hex encoded.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// Lookup seam over the daemon's key material and provisioned peers.
pub trait TrustStore: Send + Sync {
    /// The key pair new clients should encrypt to.
    fn active(&self) -> Arc<KeyPair>;

    /// Resolve a key id, honouring the rotation grace period for retired keys.
    fn lookup(&self, key_id: &KeyId) -> Result<Arc<KeyPair>, KeyError>;

    /// Signing key of a named peer.
    fn peer(&self, name: &str) -> Result<PeerIdentity, KeyError>;

    /// Every trusted peer, for envelopes that do not name their sender.
    fn peers(&self) -> Vec<PeerIdentity>;
}

pub(crate) mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 key bytes"))
    }
}
