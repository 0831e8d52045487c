// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::BTreeMap;

use proptest::prelude::*;
use shipyard_core::domain::envelope::{Envelope, RequestBody};
use shipyard_core::infrastructure::crypto::{
    decrypt, derive_shared_key, ecdh_public, encrypt, open_env, seal_env, sign, sign_envelope,
    signing_public, verify, verify_envelope, CryptoError, NONCE_LEN,
};
use shipyard_core::infrastructure::key_store::generate_key_pair;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encrypt_decrypt_round_trip(key in any::<[u8; 32]>(), plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
        let (ciphertext, nonce) = encrypt(&plaintext, &key).unwrap();
        let decrypted = decrypt(&ciphertext, &key, &nonce).unwrap();
        prop_assert_eq!(decrypted.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn prop_any_bit_flip_is_detected(
        key in any::<[u8; 32]>(),
        plaintext in proptest::collection::vec(any::<u8>(), 1..256),
        flip in any::<usize>(),
        bit in 0u8..8,
        in_nonce in any::<bool>(),
    ) {
        let (mut ciphertext, mut nonce) = encrypt(&plaintext, &key).unwrap();
        if in_nonce {
            nonce[flip % NONCE_LEN] ^= 1 << bit;
        } else {
            let len = ciphertext.len();
            ciphertext[flip % len] ^= 1 << bit;
        }
        prop_assert_eq!(decrypt(&ciphertext, &key, &nonce).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn prop_sign_verify(private in any::<[u8; 32]>(), other in any::<[u8; 32]>(), message in proptest::collection::vec(any::<u8>(), 0..256)) {
        let public = signing_public(&private);
        let signature = sign(&message, &private);
        prop_assert!(verify(&message, &signature, &public));

        let mut mutated = message.clone();
        mutated.push(0x2a);
        prop_assert!(!verify(&mutated, &signature, &public));

        prop_assume!(other != private);
        prop_assert!(!verify(&message, &signature, &signing_public(&other)));
    }

    #[test]
    fn prop_ecdh_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
        let ab = derive_shared_key(&a, &ecdh_public(&b));
        let ba = derive_shared_key(&b, &ecdh_public(&a));
        match (ab, ba) {
            (Ok(ab), Ok(ba)) => prop_assert_eq!(&ab[..], &ba[..]),
            // low-order points yield an all-zero secret and are rejected on both sides
            (Err(e1), Err(e2)) => prop_assert_eq!(e1, e2),
            _ => prop_assert!(false, "derivation succeeded on one side only"),
        }
    }
}

#[test]
fn test_signature_length_checked_before_verification() {
    let private = [5u8; 32];
    assert!(!verify(b"data", &[0u8; 63], &signing_public(&private)));
    let envelope = Envelope {
        payload: b"{}".to_vec(),
        signature: vec![0u8; 12],
        sender: None,
    };
    assert_eq!(
        verify_envelope(&envelope, &signing_public(&private)),
        Err(CryptoError::InvalidSignatureLength)
    );
}

/// Daemon keypair D, CLI ephemeral keypair C, secret set `{"DB_PASS":"s3cret"}`.
#[test]
fn test_end_to_end_secret_delivery() {
    let daemon = generate_key_pair().unwrap();
    let cli_signing = [42u8; 32];
    let cli_signing_public = signing_public(&cli_signing);

    // CLI side
    let secrets = BTreeMap::from([("DB_PASS".to_string(), "s3cret".to_string())]);
    let sealed = seal_env(&secrets, &daemon.key_id, &daemon.ecdh_public).unwrap();
    let payload = serde_json::to_vec(&sealed).unwrap();
    let envelope = sign_envelope(payload, Some("ops".into()), &cli_signing);
    let wire = serde_json::to_string(&envelope).unwrap();
    assert!(!wire.contains("s3cret"));

    // Daemon side
    let received: Envelope = serde_json::from_str(&wire).unwrap();
    verify_envelope(&received, &cli_signing_public).unwrap();
    let body: RequestBody = serde_json::from_slice(&received.payload).unwrap();
    let RequestBody::Secrets(encrypted) = body else {
        panic!("expected secrets payload");
    };
    assert_eq!(encrypted.key_id, daemon.key_id.as_str());

    let opened = open_env(&encrypted, daemon.ecdh_private.expose()).unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened["DB_PASS"].as_str(), "s3cret");
}

#[test]
fn test_tampered_envelope_fails_before_decryption() {
    let daemon = generate_key_pair().unwrap();
    let cli_signing = [9u8; 32];
    let secrets = BTreeMap::from([("API_KEY".to_string(), "k".to_string())]);
    let sealed = seal_env(&secrets, &daemon.key_id, &daemon.ecdh_public).unwrap();
    let mut envelope = sign_envelope(serde_json::to_vec(&sealed).unwrap(), None, &cli_signing);

    let last = envelope.payload.len() - 2;
    envelope.payload[last] ^= 0x01;
    assert_eq!(
        verify_envelope(&envelope, &signing_public(&cli_signing)),
        Err(CryptoError::BadSignature)
    );
}

#[test]
fn test_secrets_for_another_daemon_do_not_open() {
    let intended = generate_key_pair().unwrap();
    let other = generate_key_pair().unwrap();
    let secrets = BTreeMap::from([("DB_PASS".to_string(), "s3cret".to_string())]);
    let sealed = seal_env(&secrets, &intended.key_id, &intended.ecdh_public).unwrap();
    assert_eq!(
        open_env(&sealed, other.ecdh_private.expose()).unwrap_err(),
        CryptoError::Aead
    );
}
