// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # File-backed Trust Store
//!
//! Persists the daemon key ring and the provisioned peer identities under a
//! restricted directory:
//!
//! ```text
//! <key_dir>/            (0700)
//!   daemon-keys.json    (0600)  active + retired key pairs
//!   trusted-peers.json  (0600)  name -> Ed25519 public key
//! ```
//!
//! All writes go to a sibling temp file that is renamed into place, so a crash
//! never leaves a half-written key file behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::domain::keys::{
    KeyError, KeyId, KeyPair, PeerIdentity, SecretBytes, TrustStore, KEY_ID_LEN,
};
use crate::infrastructure::crypto::{self, CryptoError};

const KEYS_FILE: &str = "daemon-keys.json";
const PEERS_FILE: &str = "trusted-peers.json";
const KEY_FILE_VERSION: u32 = 1;

/// Produce a fresh X25519 + Ed25519 key pair with a random key id.
///
/// Fails only when the OS entropy source fails.
pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    let entropy = |e: CryptoError| KeyError::Entropy(e.to_string());
    let ecdh_private = crypto::random_bytes::<32>().map_err(entropy)?;
    let sign_private = crypto::random_bytes::<32>().map_err(entropy)?;
    let id_bytes = crypto::random_bytes::<KEY_ID_LEN>().map_err(entropy)?;

    Ok(KeyPair {
        key_id: KeyId::from_bytes(&id_bytes),
        ecdh_public: crypto::ecdh_public(&ecdh_private),
        sign_public: crypto::signing_public(&sign_private),
        ecdh_private: SecretBytes::new(ecdh_private),
        sign_private: SecretBytes::new(sign_private),
        created_at: Utc::now(),
    })
}

#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    key_id: KeyId,
    ecdh_private: String,
    ecdh_public: String,
    sign_private: String,
    sign_public: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retired_at: Option<DateTime<Utc>>,
}

impl Drop for StoredKeyPair {
    fn drop(&mut self) {
        self.ecdh_private.zeroize();
        self.sign_private.zeroize();
    }
}

impl StoredKeyPair {
    fn from_pair(pair: &KeyPair, retired_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key_id: pair.key_id.clone(),
            ecdh_private: hex::encode(pair.ecdh_private.expose()),
            ecdh_public: hex::encode(pair.ecdh_public),
            sign_private: hex::encode(pair.sign_private.expose()),
            sign_public: hex::encode(pair.sign_public),
            created_at: pair.created_at,
            retired_at,
        }
    }

    fn to_pair(&self) -> Result<KeyPair, KeyError> {
        let corrupt = |what: &str| KeyError::Corrupt(format!("{} of key {}", what, self.key_id.short()));
        let ecdh_private = decode_key(&self.ecdh_private).ok_or_else(|| corrupt("ecdh_private"))?;
        let sign_private = decode_key(&self.sign_private).ok_or_else(|| corrupt("sign_private"))?;
        let ecdh_public = decode_key(&self.ecdh_public).ok_or_else(|| corrupt("ecdh_public"))?;
        let sign_public = decode_key(&self.sign_public).ok_or_else(|| corrupt("sign_public"))?;

        // public halves are stored for operators; the private halves are authoritative
        if crypto::ecdh_public(&ecdh_private) != ecdh_public
            || crypto::signing_public(&sign_private) != sign_public
        {
            return Err(corrupt("public/private mismatch"));
        }

        Ok(KeyPair {
            key_id: self.key_id.clone(),
            ecdh_private: SecretBytes::new(ecdh_private),
            ecdh_public,
            sign_private: SecretBytes::new(sign_private),
            sign_public,
            created_at: self.created_at,
        })
    }
}

fn decode_key(value: &str) -> Option<[u8; 32]> {
    let mut bytes = hex::decode(value).ok()?;
    let key = <[u8; 32]>::try_from(bytes.as_slice()).ok();
    bytes.zeroize();
    key
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    active: StoredKeyPair,
    #[serde(default)]
    retired: Vec<StoredKeyPair>,
}

#[derive(Default, Serialize, Deserialize)]
struct PeersFile {
    #[serde(default)]
    peers: Vec<PeerIdentity>,
}

struct RetiredKey {
    pair: Arc<KeyPair>,
    retired_at: DateTime<Utc>,
}

struct KeyRing {
    active: Arc<KeyPair>,
    retired: Vec<RetiredKey>,
    peers: BTreeMap<String, PeerIdentity>,
}

/// Trust store persisted as JSON files in a private directory.
pub struct FileKeyStore {
    dir: PathBuf,
    grace: chrono::Duration,
    ring: RwLock<KeyRing>,
}

impl FileKeyStore {
    /// Load the key ring from `dir`, generating the first key pair on first run.
    pub fn open_or_init(dir: impl Into<PathBuf>, grace: Duration) -> Result<Self, KeyError> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| KeyError::Storage(format!("invalid grace period: {}", e)))?;

        let (active, retired, fresh) = match read_key_file(&dir.join(KEYS_FILE))? {
            Some((active, retired)) => (active, retired, false),
            None => (Arc::new(generate_key_pair()?), Vec::new(), true),
        };

        let peers = load_peers(&dir.join(PEERS_FILE))?;

        if !active.ecdh_private.is_locked() {
            warn!("Could not lock key material in memory (check RLIMIT_MEMLOCK)");
        }

        let store = Self {
            dir,
            grace,
            ring: RwLock::new(KeyRing {
                active,
                retired,
                peers,
            }),
        };

        if fresh {
            let ring = store.ring.read();
            store.write_keys(&ring)?;
            info!(
                key_id = %ring.active.key_id.short(),
                fingerprint = %ring.active.sign_fingerprint(),
                "Generated daemon key pair"
            );
        }

        Ok(store)
    }

    /// Whether `dir` already holds a generated key ring.
    pub fn is_initialized(dir: &Path) -> bool {
        dir.join(KEYS_FILE).is_file()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the peer file so trust changes made by another process take effect.
    /// Returns the number of trusted peers.
    pub fn reload_peers(&self) -> Result<usize, KeyError> {
        let peers = load_peers(&self.dir.join(PEERS_FILE))?;
        let mut ring = self.ring.write();
        if ring.peers != peers {
            debug!(before = ring.peers.len(), after = peers.len(), "Reloaded trusted peers");
            ring.peers = peers;
        }
        Ok(ring.peers.len())
    }

    /// Merge key changes written by another process (`shipyard keys rotate`)
    /// into the in-memory ring. Returns whether the ring changed.
    pub fn reload_keys(&self) -> Result<bool, KeyError> {
        let mut ring = self.ring.write();
        let previous = ring.active.key_id.clone();
        let changed = self.merge_from_disk(&mut ring)?;
        if ring.active.key_id != previous {
            info!(
                retired = %previous.short(),
                active = %ring.active.key_id.short(),
                "Adopted daemon key rotated by another process"
            );
        }
        Ok(changed)
    }

    /// Replace the active key pair. The previous one stays usable for lookups
    /// until the grace period elapses.
    pub fn rotate(&self) -> Result<Arc<KeyPair>, KeyError> {
        let next = Arc::new(generate_key_pair()?);
        let mut ring = self.ring.write();
        self.merge_from_disk(&mut ring)?;
        let previous = std::mem::replace(&mut ring.active, next.clone());
        info!(
            retired = %previous.key_id.short(),
            active = %next.key_id.short(),
            "Rotated daemon key pair"
        );
        ring.retired.push(RetiredKey {
            pair: previous,
            retired_at: Utc::now(),
        });
        self.write_keys(&ring)?;
        Ok(next)
    }

    /// Drop retired keys whose grace period has elapsed. Returns how many were removed.
    pub fn prune_retired(&self) -> Result<usize, KeyError> {
        let mut ring = self.ring.write();
        self.merge_from_disk(&mut ring)?;
        let before = ring.retired.len();
        let cutoff = Utc::now() - self.grace;
        ring.retired.retain(|r| r.retired_at > cutoff);
        let removed = before - ring.retired.len();
        if removed > 0 {
            info!(removed, "Pruned retired daemon keys");
            self.write_keys(&ring)?;
        }
        Ok(removed)
    }

    /// Retired key ids with the time they were retired.
    pub fn retired(&self) -> Vec<(KeyId, DateTime<Utc>)> {
        self.ring
            .read()
            .retired
            .iter()
            .map(|r| (r.pair.key_id.clone(), r.retired_at))
            .collect()
    }

    pub fn trust_peer(&self, name: &str, signing_public: [u8; 32]) -> Result<PeerIdentity, KeyError> {
        crypto::verify_public_key(&signing_public)
            .map_err(|_| KeyError::Corrupt(format!("peer {} has an invalid Ed25519 key", name)))?;
        let peer = PeerIdentity {
            name: name.to_string(),
            signing_public,
            added_at: Utc::now(),
        };
        let mut ring = self.ring.write();
        let mut peers = load_peers(&self.dir.join(PEERS_FILE))?;
        peers.insert(name.to_string(), peer.clone());
        self.write_peers(&peers)?;
        ring.peers = peers;
        info!(peer = %name, fingerprint = %peer.fingerprint(), "Trusted peer identity");
        Ok(peer)
    }

    pub fn revoke_peer(&self, name: &str) -> Result<bool, KeyError> {
        let mut ring = self.ring.write();
        let mut peers = load_peers(&self.dir.join(PEERS_FILE))?;
        let removed = peers.remove(name).is_some();
        if removed {
            self.write_peers(&peers)?;
            info!(peer = %name, "Revoked peer identity");
        }
        ring.peers = peers;
        Ok(removed)
    }

    /// Fold the on-disk key file into `ring`. The newer of the two active keys
    /// wins and the other is retired; retired keys are unioned by id.
    fn merge_from_disk(&self, ring: &mut KeyRing) -> Result<bool, KeyError> {
        let Some((disk_active, disk_retired)) = read_key_file(&self.dir.join(KEYS_FILE))? else {
            return Ok(false);
        };

        let mut changed = false;
        let mut active_retired_at = None;
        for retired in disk_retired {
            if retired.pair.key_id == ring.active.key_id {
                active_retired_at = Some(retired.retired_at);
            } else if retired.pair.key_id != disk_active.key_id
                && !ring.retired.iter().any(|r| r.pair.key_id == retired.pair.key_id)
            {
                ring.retired.push(retired);
                changed = true;
            }
        }

        if disk_active.key_id != ring.active.key_id {
            let demoted = if disk_active.created_at > ring.active.created_at {
                std::mem::replace(&mut ring.active, disk_active)
            } else {
                active_retired_at = None;
                disk_active
            };
            let active_id = ring.active.key_id.clone();
            ring.retired.retain(|r| r.pair.key_id != active_id);
            if !ring.retired.iter().any(|r| r.pair.key_id == demoted.key_id) {
                ring.retired.push(RetiredKey {
                    pair: demoted,
                    retired_at: active_retired_at.unwrap_or_else(Utc::now),
                });
            }
            changed = true;
        }
        Ok(changed)
    }

    fn write_keys(&self, ring: &KeyRing) -> Result<(), KeyError> {
        let file = KeyFile {
            version: KEY_FILE_VERSION,
            active: StoredKeyPair::from_pair(&ring.active, None),
            retired: ring
                .retired
                .iter()
                .map(|r| StoredKeyPair::from_pair(&r.pair, Some(r.retired_at)))
                .collect(),
        };
        let mut json = serde_json::to_vec_pretty(&file)
            .map_err(|e| KeyError::Storage(e.to_string()))?;
        let result = write_private_file(&self.dir.join(KEYS_FILE), &json);
        json.zeroize();
        result
    }

    fn write_peers(&self, peers: &BTreeMap<String, PeerIdentity>) -> Result<(), KeyError> {
        let file = PeersFile {
            peers: peers.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| KeyError::Storage(e.to_string()))?;
        write_private_file(&self.dir.join(PEERS_FILE), &json)
    }
}

impl TrustStore for FileKeyStore {
    fn active(&self) -> Arc<KeyPair> {
        self.ring.read().active.clone()
    }

    fn lookup(&self, key_id: &KeyId) -> Result<Arc<KeyPair>, KeyError> {
        let ring = self.ring.read();
        if &ring.active.key_id == key_id {
            return Ok(ring.active.clone());
        }
        match ring.retired.iter().find(|r| &r.pair.key_id == key_id) {
            Some(r) if Utc::now() - r.retired_at < self.grace => Ok(r.pair.clone()),
            Some(_) => Err(KeyError::Retired(key_id.clone())),
            None => Err(KeyError::NotFound(key_id.clone())),
        }
    }

    fn peer(&self, name: &str) -> Result<PeerIdentity, KeyError> {
        self.ring
            .read()
            .peers
            .get(name)
            .cloned()
            .ok_or_else(|| KeyError::UnknownPeer(name.to_string()))
    }

    fn peers(&self) -> Vec<PeerIdentity> {
        self.ring.read().peers.values().cloned().collect()
    }
}

/// The CLI's long-term Ed25519 signing identity.
#[derive(Debug)]
pub struct CliIdentity {
    pub name: String,
    pub sign_private: SecretBytes,
    pub sign_public: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    name: String,
    sign_private: String,
}

impl Drop for StoredIdentity {
    fn drop(&mut self) {
        self.sign_private.zeroize();
    }
}

impl CliIdentity {
    /// Load the identity at `path`, creating it (mode 0600) if it does not exist.
    pub fn load_or_create(path: &Path, name: &str) -> Result<Self, KeyError> {
        if path.exists() {
            return Self::load(path);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let seed = crypto::random_bytes::<32>().map_err(|e| KeyError::Entropy(e.to_string()))?;
        let stored = StoredIdentity {
            name: name.to_string(),
            sign_private: hex::encode(seed),
        };
        let mut json = serde_json::to_vec_pretty(&stored).map_err(|e| KeyError::Storage(e.to_string()))?;
        let written = write_private_file(path, &json);
        json.zeroize();
        written?;
        info!(identity = %name, path = %path.display(), "Created signing identity");
        Ok(Self {
            name: name.to_string(),
            sign_public: crypto::signing_public(&seed),
            sign_private: SecretBytes::new(seed),
        })
    }

    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let mut raw = fs::read(path).map_err(storage_err(path))?;
        let parsed = serde_json::from_slice::<StoredIdentity>(&raw);
        raw.zeroize();
        let stored = parsed.map_err(|e| KeyError::Corrupt(format!("{}: {}", path.display(), e)))?;
        let seed = decode_key(&stored.sign_private)
            .ok_or_else(|| KeyError::Corrupt(format!("{}: bad signing key", path.display())))?;
        Ok(Self {
            name: stored.name.clone(),
            sign_public: crypto::signing_public(&seed),
            sign_private: SecretBytes::new(seed),
        })
    }

    pub fn fingerprint(&self) -> String {
        crate::domain::keys::fingerprint(&self.sign_public)
    }
}

fn read_key_file(path: &Path) -> Result<Option<(Arc<KeyPair>, Vec<RetiredKey>)>, KeyError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut raw = fs::read(path).map_err(storage_err(path))?;
    let parsed = serde_json::from_slice::<KeyFile>(&raw);
    raw.zeroize();
    let file = parsed.map_err(|e| KeyError::Corrupt(format!("{}: {}", path.display(), e)))?;
    if file.version != KEY_FILE_VERSION {
        return Err(KeyError::Corrupt(format!(
            "unsupported key file version {}",
            file.version
        )));
    }
    let active = Arc::new(file.active.to_pair()?);
    let retired = file
        .retired
        .iter()
        .map(|stored| {
            Ok(RetiredKey {
                pair: Arc::new(stored.to_pair()?),
                retired_at: stored.retired_at.unwrap_or(stored.created_at),
            })
        })
        .collect::<Result<Vec<_>, KeyError>>()?;
    Ok(Some((active, retired)))
}

fn load_peers(path: &Path) -> Result<BTreeMap<String, PeerIdentity>, KeyError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read(path).map_err(storage_err(path))?;
    let file: PeersFile = serde_json::from_slice(&raw)
        .map_err(|e| KeyError::Corrupt(format!("{}: {}", path.display(), e)))?;
    Ok(file.peers.into_iter().map(|p| (p.name.clone(), p)).collect())
}

fn storage_err(path: &Path) -> impl Fn(std::io::Error) -> KeyError + '_ {
    move |e| KeyError::Storage(format!("{}: {}", path.display(), e))
}

fn ensure_private_dir(dir: &Path) -> Result<(), KeyError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        if !dir.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(storage_err(dir))?;
        } else {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(storage_err(dir))?;
        }
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir).map_err(storage_err(dir))?;
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp).map_err(storage_err(&tmp))?;
    file.write_all(contents).map_err(storage_err(&tmp))?;
    file.sync_all().map_err(storage_err(&tmp))?;
    fs::rename(&tmp, path).map_err(storage_err(path))?;
    Ok(())
}
