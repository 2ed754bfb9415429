//! Wire protocol for sync sessions
//!
//! Every frame is a text frame whose body is a UTF-8 JSON object matching
//! [`SyncMessage`]. Three message kinds exist:
//!
//! ```text
//! Dialer                              Acceptor
//!   |                                    |
//!   |--- handshake {assertion} -------->|   verify assertion,
//!   |<-- handshake_response ------------|   same account only
//!   |                                    |
//!   |--- sync_data {op,table,...} ----->|   both directions,
//!   |<-- sync_data ---------------------|   LWW applied by version
//! ```
//!
//! `sync_data` frames are signed over
//! `"{type}|{account_id}|{timestamp}|{data-json}"`. serde_json keeps
//! object keys sorted, so the data serialization is canonical. A missing
//! (empty) signature falls back to session-level trust from the handshake.

use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::identity::{DeviceAssertion, DeviceIdentity};
use crate::store::RecordData;

/// Kind of a [`SyncMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeResponse,
    SyncData,
}

impl MessageType {
    /// Wire name, as used in the signing input
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::HandshakeResponse => "handshake_response",
            MessageType::SyncData => "sync_data",
        }
    }
}

/// Mutation kind carried by a `sync_data` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Create,
    Update,
    Delete,
}

/// One record mutation in flight between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncData {
    pub operation: SyncOp,
    pub table: String,
    pub record_id: String,
    pub data: RecordData,
    /// Version chosen by the originating device; preserved verbatim on apply
    pub version: i64,
}

/// Envelope for every frame on a sync session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The sender's account
    pub account_id: String,
    /// Kind-dependent payload
    #[serde(default)]
    pub data: Value,
    /// Unix seconds at send time
    pub timestamp: i64,
    /// Hex Ed25519 signature; empty when unsigned
    #[serde(default)]
    pub signature: String,
}

impl SyncMessage {
    /// Build the opening handshake frame around a device assertion
    pub fn handshake(assertion: &DeviceAssertion) -> SyncResult<Self> {
        Ok(Self {
            kind: MessageType::Handshake,
            account_id: assertion.account_id.clone(),
            data: serde_json::to_value(assertion)
                .map_err(|e| SyncError::Serialization(e.to_string()))?,
            timestamp: assertion.timestamp,
            signature: assertion.signature.clone(),
        })
    }

    /// Build the acceptor's reply to a valid handshake
    pub fn handshake_response(account_id: &str) -> Self {
        Self {
            kind: MessageType::HandshakeResponse,
            account_id: account_id.to_string(),
            data: Value::Null,
            timestamp: Utc::now().timestamp(),
            signature: String::new(),
        }
    }

    /// Build and sign a `sync_data` frame
    pub fn sync_data(identity: &DeviceIdentity, payload: &SyncData) -> SyncResult<Self> {
        let data =
            serde_json::to_value(payload).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let timestamp = Utc::now().timestamp();
        let input =
            Self::signing_input(MessageType::SyncData, identity.account_id(), timestamp, &data)?;
        let signature = hex::encode(identity.sign(input.as_bytes()).to_bytes());

        Ok(Self {
            kind: MessageType::SyncData,
            account_id: identity.account_id().to_string(),
            data,
            timestamp,
            signature,
        })
    }

    /// The canonical byte string a message signature covers
    fn signing_input(
        kind: MessageType,
        account_id: &str,
        timestamp: i64,
        data: &Value,
    ) -> SyncResult<String> {
        let data_json =
            serde_json::to_string(data).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(format!(
            "{}|{account_id}|{timestamp}|{data_json}",
            kind.as_str()
        ))
    }

    /// Verify the message signature under the account key.
    ///
    /// An empty signature is treated as absent and passes; the session
    /// handshake is the sole authentication then.
    pub fn verify_signature(&self, key: &VerifyingKey) -> SyncResult<()> {
        if self.signature.is_empty() {
            return Ok(());
        }

        let bytes = hex::decode(&self.signature)
            .map_err(|e| SyncError::SignatureInvalid(format!("bad hex: {e}")))?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| SyncError::SignatureInvalid(e.to_string()))?;
        let input = Self::signing_input(self.kind, &self.account_id, self.timestamp, &self.data)?;

        key.verify(input.as_bytes(), &signature)
            .map_err(|_| SyncError::SignatureInvalid("signature does not verify".to_string()))
    }

    /// Extract the handshake payload
    pub fn assertion(&self) -> SyncResult<DeviceAssertion> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| SyncError::Serialization(format!("bad handshake payload: {e}")))
    }

    /// Extract the `sync_data` payload
    pub fn sync_payload(&self) -> SyncResult<SyncData> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| SyncError::Serialization(format!("bad sync payload: {e}")))
    }

    /// Serialize to the wire (a JSON text frame body)
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Parse a frame body
    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> SyncData {
        let mut data = RecordData::new();
        data.insert("title".to_string(), json!("t"));
        SyncData {
            operation: SyncOp::Create,
            table: "diary_entries".to_string(),
            record_id: "demo-1".to_string(),
            data,
            version: 7,
        }
    }

    #[test]
    fn test_wire_keys_match_protocol() {
        let identity = DeviceIdentity::generate();
        let msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["type"], json!("sync_data"));
        assert_eq!(value["account_id"], json!(identity.account_id()));
        assert_eq!(value["data"]["operation"], json!("create"));
        assert_eq!(value["data"]["record_id"], json!("demo-1"));
        assert_eq!(value["data"]["version"], json!(7));
        assert!(value["timestamp"].is_i64());
        assert!(value["signature"].is_string());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let identity = DeviceIdentity::generate();
        let msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageType::SyncData);
        let payload = decoded.sync_payload().unwrap();
        assert_eq!(payload.table, "diary_entries");
        assert_eq!(payload.version, 7);
    }

    #[test]
    fn test_handshake_carries_assertion() {
        let identity = DeviceIdentity::generate();
        let assertion = identity.sign_assertion("alpha");
        let msg = SyncMessage::handshake(&assertion).unwrap();

        assert_eq!(msg.kind, MessageType::Handshake);
        let embedded = msg.assertion().unwrap();
        assert_eq!(embedded.device_name, "alpha");
        assert!(embedded.verify().is_ok());
    }

    #[test]
    fn test_sync_data_signature_verifies() {
        let identity = DeviceIdentity::generate();
        let msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();
        assert!(msg.verify_signature(identity.verifying_key()).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let identity = DeviceIdentity::generate();
        let mut msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();
        msg.data["version"] = json!(8);

        assert!(matches!(
            msg.verify_signature(identity.verifying_key()),
            Err(SyncError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_unsigned_message_passes_verification() {
        let identity = DeviceIdentity::generate();
        let mut msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();
        msg.signature = String::new();
        assert!(msg.verify_signature(identity.verifying_key()).is_ok());
    }

    #[test]
    fn test_foreign_key_fails_verification() {
        let identity = DeviceIdentity::generate();
        let other = DeviceIdentity::generate();
        let msg = SyncMessage::sync_data(&identity, &sample_payload()).unwrap();

        assert!(matches!(
            msg.verify_signature(other.verifying_key()),
            Err(SyncError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SyncMessage::decode(r#"{"type":"gossip","account_id":"x","timestamp":0}"#);
        assert!(matches!(err, Err(SyncError::Serialization(_))));
    }
}
