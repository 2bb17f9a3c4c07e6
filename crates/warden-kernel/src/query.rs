use serde::{Deserialize, Serialize};
use warden_canon::Hash;

use crate::journal::{JournalKind, JournalRecord, JournalSeq};

/// Metadata attached to every read response so callers can reason about what they saw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMeta {
    /// Next sequence the journal will assign; every record below it is reflected in the read.
    pub journal_height: JournalSeq,
    pub workspace_id: String,
}

/// Envelope for read responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRead<T> {
    pub meta: ReadMeta,
    pub value: T,
}

impl<T> StateRead<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StateRead<U> {
        StateRead {
            meta: self.meta,
            value: f(self.value),
        }
    }
}

/// One decoded audit log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    pub chain: Hash,
    pub record: JournalRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_read_maps_value_and_keeps_meta() {
        let read = StateRead {
            meta: ReadMeta {
                journal_height: 7,
                workspace_id: "local".into(),
            },
            value: vec![1, 2, 3],
        };
        let mapped = read.map(|items| items.len());
        assert_eq!(mapped.value, 3);
        assert_eq!(mapped.meta.journal_height, 7);
    }
}
