//! Read-only queries. Each takes the shared lock once and answers from that snapshot.

use super::*;

use crate::bundle::verify::{ChainBreak, verify_chain};
use crate::journal;

impl<S: Store + 'static> Coordinator<S> {
    fn snapshot<T>(&self, f: impl FnOnce(&KernelState) -> T) -> CoordResult<StateRead<T>> {
        let inner = self.read()?;
        Ok(StateRead {
            meta: self.read_meta(&inner),
            value: f(&inner.state),
        })
    }

    pub fn work_item(&self, work_id: &WorkId) -> CoordResult<StateRead<Option<WorkItem>>> {
        self.snapshot(|state| state.ledger.get(work_id).cloned())
    }

    /// Live (not deleted) work items in creation order, optionally filtered by status.
    pub fn work_items(&self, status: Option<WorkStatus>) -> CoordResult<StateRead<Vec<WorkItem>>> {
        self.snapshot(|state| {
            state
                .ledger
                .items()
                .filter(|item| !item.deleted)
                .filter(|item| status.is_none_or(|status| item.status == status))
                .cloned()
                .collect()
        })
    }

    /// Pending items a claim would currently be granted for.
    pub fn claimable_work(&self) -> CoordResult<StateRead<Vec<WorkItem>>> {
        self.snapshot(|state| {
            state
                .ledger
                .items()
                .filter(|item| !item.deleted && item.status == WorkStatus::Pending)
                .filter(|item| state.ledger.unmet_dependencies(item).is_empty())
                .filter(|item| state.records.open_blockers(&item.id).is_empty())
                .cloned()
                .collect()
        })
    }

    pub fn attempt(&self, attempt_id: AttemptId) -> CoordResult<StateRead<Option<Attempt>>> {
        self.snapshot(|state| state.attempts.get(attempt_id).cloned())
    }

    /// The open attempt on a work item. A lapsed lease is reported as-is; it is swept on the
    /// next write.
    pub fn open_attempt(&self, work_id: &WorkId) -> CoordResult<StateRead<Option<Attempt>>> {
        self.snapshot(|state| state.attempts.open_for(work_id).cloned())
    }

    pub fn attempts_for(&self, work_id: &WorkId) -> CoordResult<StateRead<Vec<Attempt>>> {
        self.snapshot(|state| state.attempts.for_work(work_id).into_iter().cloned().collect())
    }

    pub fn blocker(&self, blocker_id: BlockerId) -> CoordResult<StateRead<Option<Blocker>>> {
        self.snapshot(|state| state.records.blocker(blocker_id).cloned())
    }

    /// Finalized runs in order.
    pub fn runs(&self) -> CoordResult<StateRead<Vec<RunEntry>>> {
        self.snapshot(|state| state.runs.iter().cloned().collect())
    }

    /// The stored manifest of a finalized run.
    pub fn run(&self, run_hash: &Hash) -> CoordResult<StateRead<Option<RunManifest>>> {
        let read =
            self.snapshot(|state| state.runs.get(run_hash).map(|entry| entry.manifest_hash))?;
        let manifest = match read.value {
            Some(manifest_hash) => Some(self.store.get_node(manifest_hash)?),
            None => None,
        };
        Ok(StateRead {
            meta: read.meta,
            value: manifest,
        })
    }

    /// Check the `prev_run_hash` links across every finalized run of this workspace.
    pub fn verify_run_chain(&self) -> CoordResult<StateRead<Result<(), ChainBreak>>> {
        let read = self.snapshot(|state| {
            state
                .runs
                .iter()
                .filter(|entry| entry.workspace_id == self.config.workspace_id)
                .map(|entry| entry.manifest_hash)
                .collect::<Vec<_>>()
        })?;
        let manifests = read
            .value
            .iter()
            .map(|hash| self.store.get_node::<RunManifest>(*hash))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StateRead {
            meta: read.meta,
            value: verify_chain(&manifests),
        })
    }

    pub fn receipt(
        &self,
        attempt_id: AttemptId,
    ) -> CoordResult<StateRead<Option<CompletionReceipt>>> {
        self.snapshot(|state| state.receipts.get(&attempt_id).cloned())
    }

    pub fn journal_height(&self) -> CoordResult<JournalSeq> {
        Ok(self.read()?.journal.next_seq())
    }

    /// Decoded audit log entries starting at `from`.
    pub fn audit_log(&self, from: JournalSeq) -> CoordResult<StateRead<Vec<AuditEntry>>> {
        let inner = self.read()?;
        let entries = inner.journal.load_from(from)?;
        let mut audit = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = JournalRecord::decode(&entry)?;
            audit.push(AuditEntry {
                seq: entry.seq,
                kind: entry.kind,
                chain: entry.chain,
                record,
            });
        }
        Ok(StateRead {
            meta: self.read_meta(&inner),
            value: audit,
        })
    }

    /// Walk the whole audit log and confirm every chain link. Returns the head chain hash.
    pub fn verify_audit_log(&self) -> CoordResult<StateRead<Hash>> {
        let inner = self.read()?;
        let entries = inner.journal.load_from(0)?;
        let head = journal::verify_chain(&entries)?;
        Ok(StateRead {
            meta: self.read_meta(&inner),
            value: head,
        })
    }
}
