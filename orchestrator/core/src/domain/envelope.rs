// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Control Message Wire Types
//!
//! ```text
//! Envelope { payload: b64, signature: b64, sender? }
//!   └─ payload (JSON) is one of
//!        Command      { "type", "args" }                    (args.env may carry an EncryptedEnv)
//!        EncryptedEnv { key_id, cli_public_key, nonce, env_blob, variables }
//! ```
//!
//! The signature covers the payload bytes only. Receivers must verify it
//! against the sender's provisioned Ed25519 key before parsing anything inside
//! the payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Signed, opaque wire container exchanged between CLI and daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    /// Name of the peer identity that signed the payload. Optional on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Secrets encrypted to one daemon key.
///
/// `env_blob` is the AEAD ciphertext of the JSON object holding the full set.
/// Each entry of `variables` is `nonce || ciphertext` of one value under the same
/// derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnv {
    pub key_id: String,
    #[serde(with = "b64")]
    pub cli_public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub env_blob: Vec<u8>,
    #[serde(default, with = "b64_map")]
    pub variables: BTreeMap<String, Vec<u8>>,
}

/// Operator intent sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Command {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// Payload variants accepted inside an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    Command(Command),
    Secrets(EncryptedEnv),
}

/// Structured answer to every request. `message` never carries secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, payload: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: Some(payload),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_map {
    use std::collections::BTreeMap;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> =
            map.iter().map(|(k, v)| (k, STANDARD.encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            payload: b"{\"type\":\"list\"}".to_vec(),
            signature: vec![1, 2, 3],
            sender: None,
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["payload"], "eyJ0eXBlIjoibGlzdCJ9");
        assert_eq!(wire["signature"], "AQID");
        assert!(wire.get("sender").is_none());
    }

    #[test]
    fn test_request_body_distinguishes_commands_from_secrets() {
        let command: RequestBody =
            serde_json::from_value(json!({"type": "stop", "args": {"name": "web"}})).unwrap();
        assert!(matches!(command, RequestBody::Command(ref c) if c.str_arg("name") == Some("web")));

        let secrets: RequestBody = serde_json::from_value(json!({
            "key_id": "ab",
            "cli_public_key": "AAAA",
            "nonce": "AAAA",
            "env_blob": "AAAA",
            "variables": {"DB_PASS": "AAAA"}
        }))
        .unwrap();
        assert!(matches!(secrets, RequestBody::Secrets(ref e) if e.variables.contains_key("DB_PASS")));
    }
}
