//! Content-addressed storage for immutable warden records, with filesystem and in-memory backends.
//!
//! Nodes are serde values stored as canonical JSON, so a node's key is exactly the hash every
//! other component computes for the same value. Blobs are raw bytes (gate logs, diffs).
//! Both kinds are write-once: storing the same content twice is a no-op and there is no update
//! or delete operation.

mod fs_store;
mod mem_store;

pub use fs_store::FsStore;
pub use mem_store::MemStore;

use serde::{Serialize, de::DeserializeOwned};
use std::{io, path::PathBuf};
use warden_canon::{CanonError, Hash};

pub type StoreResult<T> = Result<T, StoreError>;

/// Trait implemented by all content-addressed stores.
pub trait Store: Send + Sync {
    fn put_node<T: Serialize>(&self, value: &T) -> StoreResult<Hash>;
    fn get_node<T: DeserializeOwned>(&self, hash: Hash) -> StoreResult<T>;
    fn has_node(&self, hash: Hash) -> StoreResult<bool>;

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash>;
    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>>;
    fn has_blob(&self, hash: Hash) -> StoreResult<bool>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{kind:?} {hash} not found")]
    NotFound { kind: EntryKind, hash: Hash },
    #[error("canonical encoding error: {0}")]
    Canon(#[from] CanonError),
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hash mismatch for {kind:?}: expected {expected}, got {actual}")]
    HashMismatch {
        kind: EntryKind,
        expected: Hash,
        actual: Hash,
    },
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// True when the failure means the content was tampered with, as opposed to being
    /// unavailable.
    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::HashMismatch { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Node,
    Blob,
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

pub(crate) fn verify(kind: EntryKind, expected: Hash, bytes: &[u8]) -> StoreResult<()> {
    let actual = Hash::of_bytes(bytes);
    if actual != expected {
        return Err(StoreError::HashMismatch {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}
