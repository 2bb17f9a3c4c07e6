//! Canonical JSON serialization and stable SHA-256 hashing used across warden.
//!
//! Every hash in the system (plan seals, permits, contracts, run manifests, receipts) is
//! [`Hash::of_json`] over the canonical encoding produced by [`to_canonical_json`].

mod json;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_cbor::ser::Write as CborWrite;
use serde_cbor::value::Value as CborValue;
use sha2::{Digest, Sha256};
use std::fmt;

pub use json::{
    CANONICAL_VERSION, MAX_DEPTH, canonicalize, canonicalize_slice, parse_strict,
    to_canonical_json,
};

/// Optional prefix accepted when parsing hashes (e.g. `sha256:deadbeef`).
pub const HASH_PREFIX: &str = "sha256:";

/// Errors raised while producing canonical bytes. All of them are fatal for the value at hand.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonError {
    #[error("input is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidEncoding { valid_up_to: usize },
    #[error("duplicate key '{key}' in object")]
    DuplicateKey { key: String },
    #[error("JSON parse error: {0}")]
    Parse(String),
    #[error("value cannot be represented as JSON: {0}")]
    Serialize(String),
    #[error("non-finite numbers have no canonical form")]
    NonFiniteNumber,
    #[error("value nested deeper than {max_depth} levels")]
    MaxDepthExceeded { max_depth: usize },
}

/// Hash a value's canonical JSON encoding and render it as lowercase hex.
pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonError> {
    Ok(Hash::of_json(value)?.to_hex())
}

/// Serialize a value into canonical CBOR bytes (RFC 8949 deterministic rules). Used for binary
/// framing where JSON text would be wasteful; never used for content hashes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut buf = Vec::with_capacity(256);
    write_canonical_cbor(value, &mut buf)?;
    Ok(buf)
}

/// Serialize a value directly into an arbitrary CBOR writer using canonical settings.
pub fn write_canonical_cbor<T: Serialize, W>(value: &T, writer: W) -> Result<(), serde_cbor::Error>
where
    W: CborWrite,
{
    let canonical_value: CborValue = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(writer);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)
}

/// Wrapper around a 32-byte SHA-256 digest used for content addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// All-zero digest. Used as the predecessor of the first link in hash chains.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Compute the hash of a value's canonical JSON encoding.
    pub fn of_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, CanonError> {
        Ok(Self::of_bytes(&to_canonical_json(value)?))
    }

    /// Compute the hash of the provided byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Hash(arr)
    }

    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hash from hex, with or without the `sha256:` prefix.
    pub fn from_hex_str(s: &str) -> Result<Self, HashParseError> {
        let rest = s.strip_prefix(HASH_PREFIX).unwrap_or(s);
        if rest.len() != 64 {
            return Err(HashParseError::InvalidLength(rest.len()));
        }
        if rest.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(HashParseError::NotLowercase);
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf).map_err(HashParseError::InvalidHex)?;
        Ok(Hash(buf))
    }

    /// Attempt to build a hash from raw bytes, ensuring the length matches.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashLengthError> {
        if bytes.len() != 32 {
            return Err(HashLengthError(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl AsRef<[u8; 32]> for Hash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashLengthError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Hash::from_bytes(value)
    }
}

impl TryFrom<&str> for Hash {
    type Error = HashParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Hash::from_hex_str(value)
    }
}

impl std::str::FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex_str(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Hash::from_hex_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Error returned when a hash string is malformed.
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("hash hex must be lowercase")]
    NotLowercase,
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Error returned when attempting to create a hash from the wrong byte length.
#[derive(Debug, thiserror::Error)]
#[error("hash must be 32 bytes, got {0}")]
pub struct HashLengthError(pub usize);
