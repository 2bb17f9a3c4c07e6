//! Independent bundle verification.
//!
//! Checks run in a fixed order and stop at the first failure: run hash, artifact hashes,
//! signature, untracked delta. Any verifier holding the manifest and the bundle files reaches
//! the same outcome.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_canon::Hash;

use super::RunManifest;
use super::layout::ArtifactSource;
use crate::signing::MANIFEST_DOMAIN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerifyOutcome {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL.HASH_MISMATCH")]
    HashMismatch,
    #[serde(rename = "FAIL.ARTIFACT_MISMATCH")]
    ArtifactMismatch,
    #[serde(rename = "FAIL.SIGNATURE_INVALID")]
    SignatureInvalid,
    #[serde(rename = "FAIL.SIGNATURE_REQUIRED")]
    SignatureRequired,
    #[serde(rename = "FAIL.RECON.UNTRACKED_DELTA")]
    UntrackedDelta,
}

impl VerifyOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            VerifyOutcome::Pass => "PASS",
            VerifyOutcome::HashMismatch => "FAIL.HASH_MISMATCH",
            VerifyOutcome::ArtifactMismatch => "FAIL.ARTIFACT_MISMATCH",
            VerifyOutcome::SignatureInvalid => "FAIL.SIGNATURE_INVALID",
            VerifyOutcome::SignatureRequired => "FAIL.SIGNATURE_REQUIRED",
            VerifyOutcome::UntrackedDelta => "FAIL.RECON.UNTRACKED_DELTA",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, VerifyOutcome::Pass)
    }
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyPolicy {
    pub signature_required: bool,
    /// Hex ed25519 keys. When non-empty, signatures by other keys are invalid.
    pub trusted_keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub outcome: VerifyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VerifyReport {
    fn pass() -> Self {
        Self {
            outcome: VerifyOutcome::Pass,
            detail: None,
        }
    }

    fn fail(outcome: VerifyOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
        }
    }
}

pub fn verify_manifest(
    manifest: &RunManifest,
    artifacts: &dyn ArtifactSource,
    policy: &VerifyPolicy,
) -> VerifyReport {
    let recomputed = match manifest.compute_run_hash() {
        Ok(hash) => hash,
        Err(err) => {
            return VerifyReport::fail(VerifyOutcome::HashMismatch, format!("cannot hash: {err}"));
        }
    };
    match manifest.run_hash {
        Some(claimed) if claimed == recomputed => {}
        Some(claimed) => {
            return VerifyReport::fail(
                VerifyOutcome::HashMismatch,
                format!("run_hash {claimed} != recomputed {recomputed}"),
            );
        }
        None => {
            return VerifyReport::fail(VerifyOutcome::HashMismatch, "run_hash missing");
        }
    }

    for (path, expected) in &manifest.artifacts {
        match artifacts.read(path) {
            Ok(bytes) => {
                let actual = Hash::of_bytes(&bytes);
                if actual != *expected {
                    return VerifyReport::fail(
                        VerifyOutcome::ArtifactMismatch,
                        format!("{path}: expected {expected}, found {actual}"),
                    );
                }
            }
            Err(err) => {
                return VerifyReport::fail(
                    VerifyOutcome::ArtifactMismatch,
                    format!("{path}: {err}"),
                );
            }
        }
    }

    match &manifest.signature {
        Some(signature) => {
            if !signature.verify(MANIFEST_DOMAIN, &recomputed) {
                return VerifyReport::fail(VerifyOutcome::SignatureInvalid, "bad signature");
            }
            if !policy.trusted_keys.is_empty()
                && !policy.trusted_keys.contains(&signature.public_key)
            {
                return VerifyReport::fail(
                    VerifyOutcome::SignatureInvalid,
                    format!("key {} is not trusted", signature.public_key),
                );
            }
        }
        None if policy.signature_required => {
            return VerifyReport::fail(VerifyOutcome::SignatureRequired, "manifest is unsigned");
        }
        None => {}
    }

    if !manifest.untracked_delta_paths.is_empty() {
        return VerifyReport::fail(
            VerifyOutcome::UntrackedDelta,
            manifest.untracked_delta_paths.join(", "),
        );
    }

    VerifyReport::pass()
}

/// First broken link in a run sequence.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("run chain broken at index {index}: expected prev_run_hash {expected:?}, found {found:?}")]
pub struct ChainBreak {
    pub index: usize,
    pub expected: Option<Hash>,
    pub found: Option<Hash>,
}

/// Check `runs[i].prev_run_hash == hash(runs[i-1])` for every `i > 0`. The predecessor's hash is
/// recomputed, so a tampered earlier manifest also breaks the chain.
pub fn verify_chain(runs: &[RunManifest]) -> Result<(), ChainBreak> {
    for (index, pair) in runs.windows(2).enumerate() {
        let expected = pair[0].compute_run_hash().ok();
        let found = pair[1].prev_run_hash;
        if expected.is_none() || expected != found {
            return Err(ChainBreak {
                index: index + 1,
                expected,
                found,
            });
        }
    }
    Ok(())
}
