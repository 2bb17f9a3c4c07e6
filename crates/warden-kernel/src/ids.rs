//! Identifiers used by the ledger and the lease manager.
//!
//! Work item ids are caller-chosen strings. Attempt, evidence, decision and blocker ids are
//! allocated by the kernel from monotonic counters; replaying the journal restores the counters
//! so ids are never reused across restarts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen identifier of a work item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(String);

impl WorkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

sequential_id!(
    /// One claim of a work item by one claimant.
    AttemptId,
    "att"
);
sequential_id!(EvidenceId, "ev");
sequential_id!(DecisionId, "dec");
sequential_id!(BlockerId, "blk");

/// Monotonic allocator for kernel-assigned ids. Ids start at 1.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    attempts: u64,
    evidence: u64,
    decisions: u64,
    blockers: u64,
}

impl IdAllocator {
    pub fn next_attempt(&self) -> AttemptId {
        AttemptId(self.attempts + 1)
    }

    pub fn next_evidence(&self) -> EvidenceId {
        EvidenceId(self.evidence + 1)
    }

    pub fn next_decision(&self) -> DecisionId {
        DecisionId(self.decisions + 1)
    }

    pub fn next_blocker(&self) -> BlockerId {
        BlockerId(self.blockers + 1)
    }

    pub(crate) fn observe_attempt(&mut self, id: AttemptId) {
        self.attempts = self.attempts.max(id.0);
    }

    pub(crate) fn observe_evidence(&mut self, id: EvidenceId) {
        self.evidence = self.evidence.max(id.0);
    }

    pub(crate) fn observe_decision(&mut self, id: DecisionId) {
        self.decisions = self.decisions.max(id.0);
    }

    pub(crate) fn observe_blocker(&mut self, id: BlockerId) {
        self.blockers = self.blockers.max(id.0);
    }
}
