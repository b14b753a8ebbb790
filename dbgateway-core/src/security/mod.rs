//! Credential protection.
//!
//! # Module Structure
//! - `cipher`: AES-GCM field sealing with an Argon2id-derived key
//! - `credentials`: zeroizing container for a connection's secrets
//! - `connection`: connection URL parsing with immediate secret extraction
//!
//! # Security Guarantees
//! - Plaintext secrets only exist inside `Zeroizing` containers
//! - Nothing in this module implements `Display` or `Serialize` for secrets

mod cipher;
mod connection;
mod credentials;

pub use cipher::{Cipher, KdfParams};
pub use connection::{ParsedConnectionUrl, parse_connection_url};
pub use credentials::ConnectionSecrets;
