// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Codec
//!
//! Stateless primitives for the control channel:
//!
//! - X25519 key agreement, hashed with SHA-256 before use as an AES key
//! - AES-256-GCM with a fresh 12-byte nonce per call
//! - Ed25519 signatures over the envelope payload
//!
//! and the message-level helpers built on them ([`seal_env`], [`open_env`],
//! [`sign_envelope`], [`verify_envelope`]).
//!
//! Every decrypt failure collapses into [`CryptoError::Aead`] with no detail, so
//! a tampered ciphertext, a wrong key and a wrong nonce are indistinguishable.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::domain::envelope::{EncryptedEnv, Envelope};
use crate::domain::keys::KeyId;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("symmetric key must be {KEY_LEN} bytes")]
    InvalidKeyLength,
    #[error("nonce must be {NONCE_LEN} bytes")]
    InvalidNonceLength,
    #[error("decryption failed")]
    Aead,
    #[error("signature must be {SIGNATURE_LEN} bytes")]
    InvalidSignatureLength,
    #[error("signature verification failed")]
    BadSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("entropy source unavailable")]
    Entropy,
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Decrypted secret set. Values are wiped when dropped.
pub type SecretEnv = BTreeMap<String, Zeroizing<String>>;

/// Fill a fixed-size buffer from the OS entropy source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    OsRng.try_fill_bytes(&mut buf).map_err(|_| CryptoError::Entropy)?;
    Ok(buf)
}

/// X25519 public key for a private scalar.
pub fn ecdh_public(private: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*private);
    PublicKey::from(&secret).to_bytes()
}

/// Ed25519 verifying key for a signing seed.
pub fn signing_public(private: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(private).verifying_key().to_bytes()
}

/// Reject byte strings that do not decode to an Ed25519 point.
pub fn verify_public_key(sign_public: &[u8; 32]) -> Result<(), CryptoError> {
    VerifyingKey::from_bytes(sign_public)
        .map(|_| ())
        .map_err(|_| CryptoError::InvalidPublicKey)
}

/// ECDH followed by SHA-256. Commutative: `derive(a, B) == derive(b, A)`.
pub fn derive_shared_key(
    local_private: &[u8; 32],
    remote_public: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let remote: [u8; 32] = remote_public
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let secret = StaticSecret::from(*local_private);
    let shared = secret.diffie_hellman(&PublicKey::from(remote));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&hasher.finalize());
    Ok(key)
}

/// AES-256-GCM under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce = random_bytes::<NONCE_LEN>()?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Aead)?;
    Ok((ciphertext, nonce))
}

pub fn decrypt(
    ciphertext: &[u8],
    key: &[u8],
    nonce: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength);
    }
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Aead)
}

pub fn sign(data: &[u8], sign_private: &[u8; 32]) -> [u8; SIGNATURE_LEN] {
    SigningKey::from_bytes(sign_private).sign(data).to_bytes()
}

pub fn verify(data: &[u8], signature: &[u8], sign_public: &[u8]) -> bool {
    check_signature(data, signature, sign_public).is_ok()
}

fn check_signature(data: &[u8], signature: &[u8], sign_public: &[u8]) -> Result<(), CryptoError> {
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignatureLength)?;
    let key_bytes: [u8; 32] = sign_public
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    verifying_key
        .verify_strict(data, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| CryptoError::BadSignature)
}

/// Wrap a payload in a signed envelope.
pub fn sign_envelope(payload: Vec<u8>, sender: Option<String>, sign_private: &[u8; 32]) -> Envelope {
    let signature = sign(&payload, sign_private).to_vec();
    Envelope {
        payload,
        signature,
        sender,
    }
}

/// Verify an envelope before anything inside it is parsed or decrypted.
pub fn verify_envelope(envelope: &Envelope, sign_public: &[u8]) -> Result<(), CryptoError> {
    check_signature(&envelope.payload, &envelope.signature, sign_public)
}

/// Encrypt a secret set to a daemon key using a fresh ephemeral X25519 key.
pub fn seal_env(
    secrets: &BTreeMap<String, String>,
    key_id: &KeyId,
    daemon_ecdh_public: &[u8; 32],
) -> Result<EncryptedEnv, CryptoError> {
    let ephemeral = Zeroizing::new(random_bytes::<32>()?);
    let cli_public_key = ecdh_public(&ephemeral);
    let key = derive_shared_key(&ephemeral, daemon_ecdh_public)?;

    let blob = Zeroizing::new(
        serde_json::to_vec(secrets).map_err(|e| CryptoError::Encoding(e.to_string()))?,
    );
    let (env_blob, nonce) = encrypt(&blob, &key[..])?;

    let mut variables = BTreeMap::new();
    for (name, value) in secrets {
        let (ciphertext, var_nonce) = encrypt(value.as_bytes(), &key[..])?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&var_nonce);
        sealed.extend_from_slice(&ciphertext);
        variables.insert(name.clone(), sealed);
    }

    Ok(EncryptedEnv {
        key_id: key_id.to_string(),
        cli_public_key: cli_public_key.to_vec(),
        nonce: nonce.to_vec(),
        env_blob,
        variables,
    })
}

/// Decrypt a secret set with the daemon's X25519 private key.
///
/// The derived key never leaves this function. Per-variable ciphertexts must
/// agree with the blob; any disagreement is reported as [`CryptoError::Aead`].
pub fn open_env(encrypted: &EncryptedEnv, ecdh_private: &[u8; 32]) -> Result<SecretEnv, CryptoError> {
    let key = derive_shared_key(ecdh_private, &encrypted.cli_public_key)?;
    let blob = decrypt(&encrypted.env_blob, &key[..], &encrypted.nonce)?;
    let parsed: BTreeMap<String, String> =
        serde_json::from_slice(&blob).map_err(|_| CryptoError::Aead)?;
    let env: SecretEnv = parsed
        .into_iter()
        .map(|(name, value)| (name, Zeroizing::new(value)))
        .collect();

    for (name, sealed) in &encrypted.variables {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Aead);
        }
        let (var_nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let value = decrypt(ciphertext, &key[..], var_nonce)?;
        match env.get(name) {
            Some(expected) if expected.as_bytes() == value.as_slice() => {}
            _ => return Err(CryptoError::Aead),
        }
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let private = random_bytes::<32>().unwrap();
        (private, ecdh_public(&private))
    }

    #[test]
    fn test_encrypt_rejects_wrong_key_length() {
        assert_eq!(encrypt(b"data", &[0u8; 16]), Err(CryptoError::InvalidKeyLength));
        assert_eq!(
            decrypt(b"data", &[0u8; 31], &[0u8; NONCE_LEN]).unwrap_err(),
            CryptoError::InvalidKeyLength
        );
    }

    #[test]
    fn test_decrypt_rejects_bad_nonce_length() {
        let key = [3u8; KEY_LEN];
        let (ciphertext, _) = encrypt(b"payload", &key).unwrap();
        assert_eq!(
            decrypt(&ciphertext, &key, &[0u8; 8]).unwrap_err(),
            CryptoError::InvalidNonceLength
        );
    }

    #[test]
    fn test_nonces_are_fresh_per_call() {
        let key = [1u8; KEY_LEN];
        let (c1, n1) = encrypt(b"same", &key).unwrap();
        let (c2, n2) = encrypt(b"same", &key).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrong_key_looks_like_tampering() {
        let (ciphertext, nonce) = encrypt(b"secret", &[1u8; KEY_LEN]).unwrap();
        let wrong_key = decrypt(&ciphertext, &[2u8; KEY_LEN], &nonce).unwrap_err();

        let mut tampered = ciphertext.clone();
        tampered[0] ^= 0x01;
        let tampered_err = decrypt(&tampered, &[1u8; KEY_LEN], &nonce).unwrap_err();

        assert_eq!(wrong_key, tampered_err);
        assert_eq!(wrong_key.to_string(), "decryption failed");
    }

    #[test]
    fn test_signature_length_checked_before_verification() {
        let seed = [5u8; 32];
        let public = signing_public(&seed);
        assert!(!verify(b"m", &[0u8; 63], &public));
        assert_eq!(
            check_signature(b"m", &[0u8; 63], &public),
            Err(CryptoError::InvalidSignatureLength)
        );
    }

    #[test]
    fn test_derive_rejects_low_order_point() {
        let (private, _) = keypair();
        assert_eq!(
            derive_shared_key(&private, &[0u8; 32]).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
        assert_eq!(
            derive_shared_key(&private, &[1u8; 12]).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }

    #[test]
    fn test_seal_and_open_env() {
        let (daemon_private, daemon_public) = keypair();
        let key_id = KeyId::from_bytes(&[9u8; 32]);
        let secrets = BTreeMap::from([
            ("DB_PASS".to_string(), "s3cret".to_string()),
            ("API_TOKEN".to_string(), "t0k3n".to_string()),
        ]);

        let sealed = seal_env(&secrets, &key_id, &daemon_public).unwrap();
        assert_eq!(sealed.key_id, key_id.as_str());
        assert_eq!(sealed.variables.len(), 2);

        let opened = open_env(&sealed, &daemon_private).unwrap();
        assert_eq!(opened.get("DB_PASS").map(|v| v.as_str()), Some("s3cret"));
        assert_eq!(opened.get("API_TOKEN").map(|v| v.as_str()), Some("t0k3n"));
    }

    #[test]
    fn test_open_env_rejects_swapped_variable() {
        let (daemon_private, daemon_public) = keypair();
        let key_id = KeyId::from_bytes(&[9u8; 32]);
        let secrets = BTreeMap::from([
            ("A".to_string(), "one".to_string()),
            ("B".to_string(), "two".to_string()),
        ]);
        let mut sealed = seal_env(&secrets, &key_id, &daemon_public).unwrap();
        let a = sealed.variables["A"].clone();
        sealed.variables.insert("B".to_string(), a);

        assert_eq!(open_env(&sealed, &daemon_private).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn test_open_env_with_other_daemon_key_fails() {
        let (_, daemon_public) = keypair();
        let (other_private, _) = keypair();
        let sealed = seal_env(
            &BTreeMap::from([("K".to_string(), "v".to_string())]),
            &KeyId::from_bytes(&[1u8; 32]),
            &daemon_public,
        )
        .unwrap();
        assert_eq!(open_env(&sealed, &other_private).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn test_envelope_signature_covers_payload() {
        let seed = [11u8; 32];
        let public = signing_public(&seed);
        let mut envelope = sign_envelope(b"{\"type\":\"list\"}".to_vec(), Some("ops".into()), &seed);
        assert!(verify_envelope(&envelope, &public).is_ok());

        envelope.payload.push(b' ');
        assert_eq!(verify_envelope(&envelope, &public), Err(CryptoError::BadSignature));
    }
}
