use crate::{EntryKind, Store, StoreError, StoreResult, io_error, verify};
use std::{
    fmt,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use warden_canon::{Hash, to_canonical_json};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed store rooted at `<root>/.warden/store`.
#[derive(Clone)]
pub struct FsStore {
    nodes_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("nodes_dir", &self.nodes_dir)
            .field("blobs_dir", &self.blobs_dir)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let store_root = root.as_ref().join(".warden").join("store");
        let nodes_dir = store_root.join("nodes").join("sha256");
        let blobs_dir = store_root.join("blobs").join("sha256");
        fs::create_dir_all(&nodes_dir).map_err(|e| io_error(&nodes_dir, e))?;
        fs::create_dir_all(&blobs_dir).map_err(|e| io_error(&blobs_dir, e))?;
        Ok(Self {
            nodes_dir,
            blobs_dir,
        })
    }

    /// Entries are written to a temp file beside the target and renamed into place, so a
    /// reader never sees a partial entry. An existing entry is kept unless its bytes no longer
    /// hash to its name, in which case it is replaced.
    fn write_once(kind: EntryKind, hash: Hash, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        match fs::read(path) {
            Ok(existing) if verify(kind, hash, &existing).is_ok() => return Ok(()),
            Ok(_) => log::warn!("replacing corrupt {kind:?} entry {hash}"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(path, err)),
        }
        let parent = path.parent().ok_or_else(|| {
            let err = std::io::Error::new(ErrorKind::InvalidInput, "entry path has no parent");
            io_error(path, err)
        })?;
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;

        let tmp_path = parent.join(format!(
            ".{}.tmp-{}-{}",
            hash.to_hex(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(err) = written {
            discard_tmp(&tmp_path);
            return Err(io_error(&tmp_path, err));
        }
        fs::rename(&tmp_path, path).map_err(|err| {
            discard_tmp(&tmp_path);
            io_error(path, err)
        })
    }

    /// Entries fan out over a two-character prefix directory to keep listings short.
    fn entry_path(dir: &Path, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        dir.join(&hex[..2]).join(hex)
    }

    fn path_for(&self, kind: EntryKind, hash: &Hash) -> PathBuf {
        match kind {
            EntryKind::Node => Self::entry_path(&self.nodes_dir, hash),
            EntryKind::Blob => Self::entry_path(&self.blobs_dir, hash),
        }
    }

    fn read_entry(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let path = self.path_for(kind, &hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound { kind, hash });
            }
            Err(err) => return Err(io_error(path, err)),
        };
        verify(kind, hash, &bytes)?;
        Ok(bytes)
    }
}

fn discard_tmp(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::debug!("could not remove {}: {err}", path.display());
    }
}

impl Store for FsStore {
    fn put_node<T: serde::Serialize>(&self, value: &T) -> StoreResult<Hash> {
        let bytes = to_canonical_json(value)?;
        let hash = Hash::of_bytes(&bytes);
        let path = self.path_for(EntryKind::Node, &hash);
        Self::write_once(EntryKind::Node, hash, &path, &bytes)?;
        Ok(hash)
    }

    fn get_node<T: serde::de::DeserializeOwned>(&self, hash: Hash) -> StoreResult<T> {
        let bytes = self.read_entry(EntryKind::Node, hash)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn has_node(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self.path_for(EntryKind::Node, &hash).exists())
    }

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        let path = self.path_for(EntryKind::Blob, &hash);
        Self::write_once(EntryKind::Blob, hash, &path, bytes)?;
        Ok(hash)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        self.read_entry(EntryKind::Blob, hash)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        Ok(self.path_for(EntryKind::Blob, &hash).exists())
    }
}
