//! Identity types shared across the pool: hashes and account ids.
//!
//! Both are fixed 32-byte values that display as lowercase hex.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for loan receipt identities (domain-separated BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque 32-byte account identifier (depositors, borrowers, tokens, collaborators).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    /// The zero account. Never a valid borrower.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Derive a deterministic account id from a human-readable label.
    ///
    /// `BLAKE3("strata/account" || label)`. Used by tooling and tests to name
    /// accounts without managing keys.
    pub fn from_label(label: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"strata/account");
        hasher.update(label.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero account.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for AccountId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}
