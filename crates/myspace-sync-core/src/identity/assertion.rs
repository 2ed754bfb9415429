//! Signed device assertions exchanged during the handshake

use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// A device's claim of membership in an account.
///
/// Carried as the payload of a `handshake` message. The signature covers
/// the canonical string `"{account_id}|{device_name}|{timestamp}"` and the
/// account id must be the SHA-256 of the embedded public key, so the
/// assertion is self-authenticating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAssertion {
    /// Account the device claims to belong to
    pub account_id: String,
    /// Ed25519 public key, hex encoded
    pub public_key: String,
    /// Human-readable device name
    pub device_name: String,
    /// Unix seconds at signing time
    pub timestamp: i64,
    /// Ed25519 signature over the canonical string, hex encoded
    pub signature: String,
}

impl DeviceAssertion {
    /// The canonical byte string covered by the signature
    pub fn signing_input(account_id: &str, device_name: &str, timestamp: i64) -> String {
        format!("{account_id}|{device_name}|{timestamp}")
    }

    /// Verify the assertion.
    ///
    /// Succeeds iff the public key decodes to the Ed25519 key size, the
    /// signature verifies over the canonical string, and the account id is
    /// the SHA-256 of the public key. Any other outcome is
    /// `SyncError::AssertionInvalid`.
    pub fn verify(&self) -> SyncResult<()> {
        let public_key = hex::decode(&self.public_key)
            .map_err(|e| SyncError::AssertionInvalid(format!("bad public key hex: {e}")))?;

        let key_bytes: [u8; PUBLIC_KEY_LENGTH] = public_key
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::AssertionInvalid("wrong public key size".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SyncError::AssertionInvalid(format!("bad public key: {e}")))?;

        let signature_bytes = hex::decode(&self.signature)
            .map_err(|e| SyncError::AssertionInvalid(format!("bad signature hex: {e}")))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| SyncError::AssertionInvalid(format!("bad signature: {e}")))?;

        let input = Self::signing_input(&self.account_id, &self.device_name, self.timestamp);
        verifying_key
            .verify(input.as_bytes(), &signature)
            .map_err(|_| SyncError::AssertionInvalid("signature does not verify".to_string()))?;

        if hex::encode(Sha256::digest(key_bytes)) != self.account_id {
            return Err(SyncError::AssertionInvalid(
                "account id does not match public key".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;

    fn fresh_assertion() -> DeviceAssertion {
        DeviceIdentity::generate().sign_assertion("alpha")
    }

    #[test]
    fn test_signed_assertion_verifies() {
        assert!(fresh_assertion().verify().is_ok());
    }

    #[test]
    fn test_tampered_account_id_rejected() {
        let mut assertion = fresh_assertion();
        assertion.account_id = "f".repeat(64);
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_tampered_device_name_rejected() {
        let mut assertion = fresh_assertion();
        assertion.device_name = "beta".to_string();
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_tampered_timestamp_rejected() {
        let mut assertion = fresh_assertion();
        assertion.timestamp += 1;
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_flipped_signature_byte_rejected() {
        let mut assertion = fresh_assertion();
        let mut bytes = hex::decode(&assertion.signature).unwrap();
        bytes[0] ^= 0x01;
        assertion.signature = hex::encode(bytes);
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_foreign_public_key_rejected() {
        // Signature from one identity, public key and account from another.
        let mut assertion = fresh_assertion();
        let other = DeviceIdentity::generate();
        assertion.public_key = hex::encode(other.verifying_key().as_bytes());
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_truncated_public_key_rejected() {
        let mut assertion = fresh_assertion();
        assertion.public_key.truncate(32);
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let mut assertion = fresh_assertion();
        assertion.signature = "zz".to_string();
        assert!(matches!(
            assertion.verify(),
            Err(SyncError::AssertionInvalid(_))
        ));
    }
}
