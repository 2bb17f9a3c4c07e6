use std::sync::{Arc, Mutex, MutexGuard};

use warden_canon::Hash;

use super::{
    GENESIS_CHAIN, Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry, chain_hash,
};

/// In-memory journal for tests and ephemeral coordinators. Clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct MemJournal {
    entries: Arc<Mutex<Vec<OwnedJournalEntry>>>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[OwnedJournalEntry]) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries.to_vec())),
        }
    }

    pub fn entries(&self) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self.guard()?.clone())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Vec<OwnedJournalEntry>>, JournalError> {
        self.entries.lock().map_err(|_| JournalError::Poisoned)
    }
}

impl Journal for MemJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut guard = self.guard()?;
        let seq = guard.len() as JournalSeq;
        let prev: Hash = guard.last().map(|last| last.chain).unwrap_or(GENESIS_CHAIN);
        guard.push(OwnedJournalEntry {
            seq,
            kind: entry.kind,
            payload: entry.payload.to_vec(),
            chain: chain_hash(&prev, seq, entry.kind, entry.payload),
        });
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self
            .guard()?
            .iter()
            .filter(|entry| entry.seq >= from)
            .cloned()
            .collect())
    }

    fn next_seq(&self) -> JournalSeq {
        self.entries
            .lock()
            .map(|guard| guard.len() as JournalSeq)
            .unwrap_or_else(|poisoned| poisoned.into_inner().len() as JournalSeq)
    }
}
