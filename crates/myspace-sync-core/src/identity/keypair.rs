//! Ed25519 device keypair with on-disk persistence
//!
//! The identity file is the only process-wide persistent state of the
//! engine. It is written once with owner-only permissions and never
//! regenerated over an existing (even unreadable) file.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::identity::DeviceAssertion;

/// On-disk representation of an identity (`identity.json`)
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    /// Ed25519 seed, hex encoded
    private_key: String,
    /// Ed25519 public key, hex encoded
    public_key: String,
    /// Lowercase hex SHA-256 of the public key
    account_id: String,
}

/// Cryptographic identity of a device.
///
/// Two devices sharing the same identity file form one account and will
/// synchronize with each other once they discover one another on the LAN.
pub struct DeviceIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    account_id: String,
}

impl DeviceIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("OS RNG unavailable");
        let signing_key = SigningKey::from_bytes(&seed);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let account_id = derive_account_id(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            account_id,
        }
    }

    /// Load the identity from `<data_dir>/identity.json`, or generate and
    /// persist a new one if no file exists.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Io` if the file or directory cannot be accessed,
    /// and `SyncError::IdentityCorrupt` if an existing file does not parse
    /// or is internally inconsistent. A corrupt file is never overwritten.
    pub fn load_or_create(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        let path = data_dir.as_ref().join("identity.json");

        if path.exists() {
            let identity = Self::load(&path)?;
            info!(account_id = %identity.account_id, "Loaded existing identity");
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(&path)?;
        info!(account_id = %identity.account_id, "Generated new identity");
        Ok(identity)
    }

    fn load(path: &Path) -> SyncResult<Self> {
        let data = fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&data)
            .map_err(|e| SyncError::IdentityCorrupt(e.to_string()))?;

        let seed: [u8; 32] = hex::decode(&file.private_key)
            .map_err(|e| SyncError::IdentityCorrupt(format!("bad private key hex: {e}")))?
            .try_into()
            .map_err(|_| SyncError::IdentityCorrupt("private key is not 32 bytes".to_string()))?;

        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));

        // The stored public key and account id must match what the seed
        // derives, otherwise the file has been tampered with or truncated.
        if hex::encode(identity.verifying_key.as_bytes()) != file.public_key {
            return Err(SyncError::IdentityCorrupt(
                "public key does not match private key".to_string(),
            ));
        }
        if identity.account_id != file.account_id {
            return Err(SyncError::IdentityCorrupt(
                "account id does not match public key".to_string(),
            ));
        }

        Ok(identity)
    }

    /// Persist the identity with owner-only permissions.
    ///
    /// The file is written to a temporary sibling and renamed into place
    /// so a crash never leaves a half-written identity.
    fn save(&self, path: &Path) -> SyncResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
            set_permissions(dir, 0o700)?;
        }

        let file = IdentityFile {
            private_key: hex::encode(self.signing_key.to_bytes()),
            public_key: hex::encode(self.verifying_key.as_bytes()),
            account_id: self.account_id.clone(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let tmp = tmp_path(path);
        fs::write(&tmp, data)?;
        set_permissions(&tmp, 0o600)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// The account this device belongs to (lowercase hex SHA-256 of the
    /// public key, 64 characters)
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// The Ed25519 public key of this account
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Sign arbitrary bytes with the device key
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature under this account's public key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying_key.verify(message, signature).is_ok()
    }

    /// Produce a signed assertion binding this device to the account.
    ///
    /// The signature covers `"{account_id}|{device_name}|{timestamp}"`
    /// with the timestamp taken from the wall clock in Unix seconds.
    pub fn sign_assertion(&self, device_name: &str) -> DeviceAssertion {
        let timestamp = chrono::Utc::now().timestamp();
        let input = DeviceAssertion::signing_input(&self.account_id, device_name, timestamp);
        let signature = self.sign(input.as_bytes());

        DeviceAssertion {
            account_id: self.account_id.clone(),
            public_key: hex::encode(self.verifying_key.as_bytes()),
            device_name: device_name.to_string(),
            timestamp,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    /// Check whether another account id names this account
    pub fn is_same_account(&self, other_account_id: &str) -> bool {
        self.account_id == other_account_id
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Derive the account id from public key bytes
pub(crate) fn derive_account_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_is_sha256_of_public_key() {
        let identity = DeviceIdentity::generate();
        let expected = hex::encode(Sha256::digest(identity.verifying_key().as_bytes()));
        assert_eq!(identity.account_id(), expected);
        assert_eq!(identity.account_id().len(), 64);
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::load_or_create(dir.path()).unwrap();
        let second = DeviceIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first.account_id(), second.account_id());
        assert_eq!(
            first.verifying_key().as_bytes(),
            second.verifying_key().as_bytes()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let _ = DeviceIdentity::load_or_create(dir.path()).unwrap();

        let meta = std::fs::metadata(dir.path().join("identity.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_identity_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json at all").unwrap();

        let err = DeviceIdentity::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, SyncError::IdentityCorrupt(_)));

        // The broken file must survive untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json at all");
    }

    #[test]
    fn test_mismatched_account_id_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let _identity = DeviceIdentity::load_or_create(dir.path()).unwrap();

        let path = dir.path().join("identity.json");
        let mut file: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file["account_id"] = serde_json::Value::String("0".repeat(64));
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let err = DeviceIdentity::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, SyncError::IdentityCorrupt(_)));
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let identity = DeviceIdentity::generate();
        let signature = identity.sign(b"hello");
        assert!(identity.verify(b"hello", &signature));
        assert!(!identity.verify(b"other", &signature));
    }

    #[test]
    fn test_is_same_account() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert!(a.is_same_account(a.account_id()));
        assert!(!a.is_same_account(b.account_id()));
    }
}
