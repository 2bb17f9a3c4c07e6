//! Planning-side writes on the work ledger, plus lease renewal, blocker resolution and gate
//! exceptions.

use super::*;

use crate::lease::Lease;
use crate::records::check_exception;

impl<S: Store + 'static> Coordinator<S> {
    /// Create a work item. Re-creating it with the same title and requirements is a no-op.
    pub fn create_work_item(
        &self,
        work_id: WorkId,
        title: &str,
        requirements: Requirements,
    ) -> CoordResult<WorkItem> {
        self.transact("create_work_item", Scope::work(&work_id), |txn| {
            let check = txn
                .state()
                .ledger
                .check_create(&work_id, title, &requirements)?;
            if check == CreateCheck::New {
                txn.commit(JournalRecord::WorkItemCreated(WorkItemCreatedRecord {
                    work_id: work_id.clone(),
                    title: title.to_string(),
                    requirements,
                    created_at: txn.now,
                }))?;
                log::debug!("created work item {work_id}");
            }
            item_of(txn.state(), &work_id)
        })
    }

    /// Make `work_id` depend on `depends_on`. Edges that would close a cycle are refused.
    pub fn add_dependency(&self, work_id: &WorkId, depends_on: &WorkId) -> CoordResult<WorkItem> {
        self.transact("add_dependency", Scope::work(work_id), |txn| {
            if txn.state().ledger.check_dependency(work_id, depends_on)? {
                txn.commit(JournalRecord::DependencyAdded(DependencyAddedRecord {
                    work_id: work_id.clone(),
                    depends_on: depends_on.clone(),
                    added_at: txn.now,
                }))?;
            }
            item_of(txn.state(), work_id)
        })
    }

    /// Take a pending or blocked item out of the claimable pool.
    pub fn defer_work(&self, work_id: &WorkId) -> CoordResult<WorkItem> {
        self.transact("defer_work", Scope::work(work_id), |txn| {
            let status = txn
                .state()
                .ledger
                .check_planning_change(
                    work_id,
                    &[WorkStatus::Pending, WorkStatus::Blocked, WorkStatus::Deferred],
                    "status",
                )?
                .status;
            if status != WorkStatus::Deferred {
                txn.commit(JournalRecord::WorkItemDeferred(WorkItemChangeRecord {
                    work_id: work_id.clone(),
                    changed_at: txn.now,
                }))?;
            }
            item_of(txn.state(), work_id)
        })
    }

    pub fn resume_work(&self, work_id: &WorkId) -> CoordResult<WorkItem> {
        self.transact("resume_work", Scope::work(work_id), |txn| {
            let status = txn
                .state()
                .ledger
                .check_planning_change(
                    work_id,
                    &[WorkStatus::Deferred, WorkStatus::Pending],
                    "status",
                )?
                .status;
            if status == WorkStatus::Deferred {
                txn.commit(JournalRecord::WorkItemResumed(WorkItemChangeRecord {
                    work_id: work_id.clone(),
                    changed_at: txn.now,
                }))?;
            }
            item_of(txn.state(), work_id)
        })
    }

    /// Soft-delete an item. History is kept; an item with an open attempt cannot be deleted.
    pub fn delete_work_item(&self, work_id: &WorkId) -> CoordResult<WorkItem> {
        self.transact("delete_work_item", Scope::work(work_id), |txn| {
            if txn
                .state()
                .ledger
                .get(work_id)
                .is_some_and(|item| item.deleted)
            {
                return item_of(txn.state(), work_id);
            }
            txn.state().ledger.check_planning_change(
                work_id,
                &[
                    WorkStatus::Pending,
                    WorkStatus::Blocked,
                    WorkStatus::Completed,
                    WorkStatus::Deferred,
                ],
                "status",
            )?;
            txn.commit(JournalRecord::WorkItemDeleted(WorkItemChangeRecord {
                work_id: work_id.clone(),
                changed_at: txn.now,
            }))?;
            log::info!("deleted work item {work_id}");
            item_of(txn.state(), work_id)
        })
    }

    /// Extend an open attempt's lease by the configured TTL from now.
    pub fn renew_lease(&self, attempt_id: AttemptId) -> CoordResult<Lease> {
        self.transact("renew_lease", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            txn.state().attempts.check_open(attempt_id)?;
            txn.commit(JournalRecord::LeaseRenewed(LeaseRenewedRecord {
                attempt_id,
                renewed_at: txn.now,
                lease_expires_at: self.lease_expiry(txn.now),
            }))?;
            Ok(txn.state().attempts.check_exists(attempt_id)?.lease.clone())
        })
    }

    /// Resolve a blocker by pointing at evidence or giving a justification.
    pub fn resolve_blocker(
        &self,
        blocker_id: BlockerId,
        basis: ResolutionBasis,
    ) -> CoordResult<Blocker> {
        self.transact("resolve_blocker", Scope::default(), |txn| {
            let check = txn.state().records.check_resolution(blocker_id, &basis)?;
            if check == Recorded::New {
                txn.commit(JournalRecord::BlockerResolved(BlockerResolvedRecord {
                    blocker_id,
                    resolution: BlockerResolution {
                        basis,
                        resolved_at: txn.now,
                    },
                }))?;
                log::info!("resolved {blocker_id}");
            }
            txn.state().records.blocker(blocker_id).cloned().ok_or_else(|| {
                Violation::invalid("blocker_id", format!("blocker {blocker_id} does not exist"))
                    .into()
            })
        })
    }

    /// Let an open attempt complete without a passing `gate_id` until the exception expires.
    /// The grantor must be someone other than the claimant.
    pub fn grant_gate_exception(
        &self,
        attempt_id: AttemptId,
        request: GateExceptionRequest,
    ) -> CoordResult<GateException> {
        self.transact("grant_gate_exception", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            let attempt = txn.state().attempts.check_open(attempt_id)?;
            check_exception(
                &attempt.claimant,
                &request,
                self.config.max_exception_ttl_minutes,
            )?;
            let exception = GateException {
                attempt_id,
                gate_id: request.gate_id.trim().to_string(),
                reason: request.reason,
                granted_by: request.granted_by.trim().to_string(),
                granted_at: txn.now,
                expires_at: txn
                    .now
                    .saturating_add(u64::from(request.ttl_minutes) * MS_PER_MINUTE),
            };
            txn.commit(JournalRecord::GateExceptionGranted(exception.clone()))?;
            log::warn!(
                "{attempt_id} excused from gate {} by {} until {}",
                exception.gate_id,
                exception.granted_by,
                exception.expires_at
            );
            Ok(exception)
        })
    }
}

fn item_of(state: &KernelState, work_id: &WorkId) -> CoordResult<WorkItem> {
    state
        .ledger
        .get(work_id)
        .cloned()
        .ok_or_else(|| {
            Violation::WorkItemNotFound {
                work_id: work_id.clone(),
            }
            .into()
        })
}
