use crate::{EntryKind, Store, StoreError, StoreResult, verify};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use warden_canon::{Hash, to_canonical_json};

type EntryMap = RwLock<HashMap<Hash, Vec<u8>>>;

#[derive(Clone, Default)]
pub struct MemStore {
    nodes: Arc<EntryMap>,
    blobs: Arc<EntryMap>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = |map: &EntryMap| map.read().map(|guard| guard.len()).unwrap_or(0);
        f.debug_struct("MemStore")
            .field("nodes", &count(&self.nodes))
            .field("blobs", &count(&self.blobs))
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_bytes(map: &EntryMap, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let guard = map.read().map_err(|_| StoreError::LockPoisoned)?;
        let bytes = guard
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound { kind, hash })?;
        verify(kind, hash, &bytes)?;
        Ok(bytes)
    }

    fn insert_if_absent(map: &EntryMap, hash: Hash, bytes: Vec<u8>) -> StoreResult<()> {
        let mut guard = map.write().map_err(|_| StoreError::LockPoisoned)?;
        guard.entry(hash).or_insert(bytes);
        Ok(())
    }

    fn contains(map: &EntryMap, hash: &Hash) -> StoreResult<bool> {
        let guard = map.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.contains_key(hash))
    }
}

impl Store for MemStore {
    fn put_node<T: Serialize>(&self, value: &T) -> StoreResult<Hash> {
        let bytes = to_canonical_json(value)?;
        let hash = Hash::of_bytes(&bytes);
        Self::insert_if_absent(&self.nodes, hash, bytes)?;
        Ok(hash)
    }

    fn get_node<T: DeserializeOwned>(&self, hash: Hash) -> StoreResult<T> {
        let bytes = Self::load_bytes(&self.nodes, EntryKind::Node, hash)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn has_node(&self, hash: Hash) -> StoreResult<bool> {
        Self::contains(&self.nodes, &hash)
    }

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        Self::insert_if_absent(&self.blobs, hash, bytes.to_vec())?;
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        Self::load_bytes(&self.blobs, EntryKind::Blob, hash)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Self::contains(&self.blobs, &hash)
    }
}
