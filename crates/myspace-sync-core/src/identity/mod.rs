//! Device identity and account binding
//!
//! Every device owns an Ed25519 keypair. The account identifier is the
//! lowercase hex SHA-256 of the public key, so all devices provisioned
//! from the same identity file belong to the same account. Handshakes
//! exchange signed [`DeviceAssertion`]s to prove possession of the key.

mod assertion;
mod keypair;

pub use assertion::DeviceAssertion;
pub use keypair::DeviceIdentity;
