//! On-disk bundle layout:
//!
//! ```text
//! <bundle dir>/
//!   manifest.json            canonical JSON
//!   logs/<gate>.stdout.log
//!   logs/<gate>.stderr.log
//!   <other artifacts>        paths as listed in the manifest
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use warden_canon::{Hash, parse_strict, to_canonical_json};
use warden_store::Store;

use super::{Bundle, BundleError, RunManifest};
use crate::error::KernelError;
use crate::reconcile::normalize_path;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOG_DIR: &str = "logs";

/// Bundle-relative path of a gate's log stream.
pub fn log_path(gate_id: &str, stream: &str) -> String {
    let safe: String = gate_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{LOG_DIR}/{safe}.{stream}.log")
}

/// Extra artifacts need a canonical relative path that stays clear of the manifest and the
/// gate log directory.
pub fn check_artifact_path(path: &str) -> Result<(), BundleError> {
    let invalid = |reason| BundleError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if path.is_empty() || normalize_path(path).as_deref() != Some(path) {
        return Err(invalid("is not a canonical relative path"));
    }
    let in_logs = path
        .strip_prefix(LOG_DIR)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
    if path == MANIFEST_FILE || in_logs {
        return Err(invalid("is reserved for the manifest and gate logs"));
    }
    Ok(())
}

/// Source of artifact bytes for verification.
pub trait ArtifactSource {
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
}

impl ArtifactSource for BTreeMap<String, Vec<u8>> {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}

/// Artifacts read from a bundle directory.
#[derive(Debug, Clone)]
pub struct DirArtifacts {
    root: PathBuf,
}

impl DirArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactSource for DirArtifacts {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(relative(path)?))
    }
}

/// Artifacts read back from the content-addressed store by the hashes a manifest lists.
pub struct StoreArtifacts<'a, S: Store> {
    store: &'a S,
    index: &'a BTreeMap<String, Hash>,
}

impl<'a, S: Store> StoreArtifacts<'a, S> {
    pub fn new(store: &'a S, index: &'a BTreeMap<String, Hash>) -> Self {
        Self { store, index }
    }
}

impl<S: Store> ArtifactSource for StoreArtifacts<'_, S> {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let hash = self
            .index
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        self.store
            .get_blob(*hash)
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

/// Write a bundle under `dir`, creating it if needed.
pub fn write_bundle(dir: &Path, bundle: &Bundle) -> Result<(), KernelError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| KernelError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    for (rel, bytes) in &bundle.files {
        let target = dir.join(relative(rel).map_err(io_err(dir))?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(&target, bytes).map_err(io_err(&target))?;
    }
    let manifest = to_canonical_json(&bundle.manifest)?;
    let manifest_path = dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, manifest).map_err(io_err(&manifest_path))?;
    Ok(())
}

/// Read a manifest, rejecting duplicate keys and non-UTF-8 text.
pub fn read_manifest(dir: &Path) -> Result<RunManifest, KernelError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).map_err(|source| KernelError::Io {
        path: path.clone(),
        source,
    })?;
    parse_manifest(&bytes)
}

pub fn parse_manifest(bytes: &[u8]) -> Result<RunManifest, KernelError> {
    let text = std::str::from_utf8(bytes).map_err(|err| {
        KernelError::Canon(warden_canon::CanonError::InvalidEncoding {
            valid_up_to: err.valid_up_to(),
        })
    })?;
    let value = parse_strict(text)?;
    serde_json::from_value(value)
        .map_err(|err| KernelError::Canon(warden_canon::CanonError::Parse(err.to_string())))
}

/// Open a bundle directory for verification.
pub fn load_bundle(dir: &Path) -> Result<(RunManifest, DirArtifacts), KernelError> {
    Ok((read_manifest(dir)?, DirArtifacts::new(dir)))
}

/// Bundle paths must stay inside the bundle.
pub(crate) fn relative(path: &str) -> io::Result<PathBuf> {
    let candidate = Path::new(path);
    let escapes = candidate.components().any(|component| {
        !matches!(component, Component::Normal(_) | Component::CurDir)
    });
    if escapes || path.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("artifact path '{path}' escapes the bundle"),
        ));
    }
    Ok(candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::test_bundle;
    use tempfile::TempDir;
    use warden_store::MemStore;

    #[test]
    fn log_paths_are_sanitized() {
        assert_eq!(log_path("unit", "stdout"), "logs/unit.stdout.log");
        assert_eq!(log_path("../../etc", "stderr"), "logs/.._.._etc.stderr.log");
        assert_eq!(log_path("cargo test", "stdout"), "logs/cargo_test.stdout.log");
    }

    #[test]
    fn writes_and_reads_back_a_bundle() {
        let tmp = TempDir::new().unwrap();
        let bundle = test_bundle(None);
        write_bundle(tmp.path(), &bundle).unwrap();

        assert!(tmp.path().join("logs/unit.stdout.log").exists());
        let (manifest, artifacts) = load_bundle(tmp.path()).unwrap();
        assert_eq!(manifest, bundle.manifest);
        assert_eq!(artifacts.read("logs/unit.stdout.log").unwrap(), b"42 passed");
        assert!(artifacts.read("../manifest.json").is_err());
    }

    #[test]
    fn duplicate_manifest_keys_are_rejected() {
        let err = parse_manifest(br#"{"run_id":"a","run_id":"b"}"#).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Canon(warden_canon::CanonError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn store_artifacts_follow_the_manifest_index() {
        let store = MemStore::new();
        let bundle = test_bundle(None);
        for bytes in bundle.files.values() {
            store.put_blob(bytes).unwrap();
        }
        let source = StoreArtifacts::new(&store, &bundle.manifest.artifacts);
        assert_eq!(source.read("logs/unit.stdout.log").unwrap(), b"42 passed");
        assert!(source.read("logs/missing.log").is_err());
    }
}
