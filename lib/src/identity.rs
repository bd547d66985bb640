//! Provides the per-node identity and key material
//!
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a node identity in bytes
pub const ID_SIZE: usize = 32;

/// Length of a symmetric encryption key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Length of the network digest of a user key in bytes
pub const NET_KEY_SIZE: usize = 16;

/// An opaque random identifier generated once per process start.
/// Doubles as the first path segment under the storage root, so a
/// node can tell its own originals from replicas it holds for others.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Copy, Clone)]
pub struct NodeId([u8; ID_SIZE]);

/// A node's symmetric encryption key. Generated at startup and kept
/// in memory only. There is no key exchange: a node can only decrypt
/// data that was encrypted under its own key.
#[derive(PartialEq, Eq, Clone)]
pub struct SecretKey([u8; KEY_SIZE]);

/// A short digest of the external key used in wire messages. The
/// network never sees the original key.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Copy, Clone)]
pub struct NetKey([u8; NET_KEY_SIZE]);

impl NodeId {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut id = [0u8; ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Hex form used as the owner path segment
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; ID_SIZE]> for NodeId {
    fn from(raw: [u8; ID_SIZE]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // full ids are unwieldy in log lines
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl SecretKey {
    /// Generate a fresh random AES-256 key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for SecretKey {
    fn from(raw: [u8; KEY_SIZE]) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never print key material
        write!(f, "SecretKey(..)")
    }
}

impl NetKey {
    /// Digest a user-supplied key into its network form. SHA-256
    /// truncated to 128 bits, deterministic and collision-resistant
    /// enough for the replication model.
    pub fn digest(key: &[u8]) -> Self {
        let full = Sha256::digest(key);
        let mut short = [0u8; NET_KEY_SIZE];
        short.copy_from_slice(&full[..NET_KEY_SIZE]);
        Self(short)
    }

    /// Hex form, used as the storage key on replicas
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
