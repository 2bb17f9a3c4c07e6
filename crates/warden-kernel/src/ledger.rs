//! Work Ledger: work items, their dependency graph and lifecycle status.
//!
//! The dependency graph stays acyclic: every edge insert is checked against the current graph
//! before it is journaled. Items are soft-deleted only.

use indexmap::{IndexMap, IndexSet};
use petgraph::{algo::is_cyclic_directed, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::{CoordError, IntegrityViolation, Unmet, Violation};
use crate::ids::WorkId;
use crate::journal::{DependencyAddedRecord, WorkItemChangeRecord, WorkItemCreatedRecord};
use crate::records::ArtifactKind;

/// Lifecycle status of a work item. Aliases keep older persisted spellings readable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[serde(alias = "todo", alias = "open")]
    Pending,
    #[serde(alias = "in-progress", alias = "doing")]
    InProgress,
    Blocked,
    #[serde(alias = "done")]
    Completed,
    Deferred,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Blocked => "blocked",
            WorkStatus::Completed => "completed",
            WorkStatus::Deferred => "deferred",
        }
    }
}

/// Per-item requirements folded into the attempt contract at claim time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Path globs the work is expected to touch.
    pub scope: Vec<String>,
    pub required_gates: Vec<String>,
    pub required_evidence: Vec<ArtifactKind>,
    /// Catalog standard ids that apply on top of the mandatory ones.
    pub standards: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,
    pub title: String,
    pub status: WorkStatus,
    pub depends_on: IndexSet<WorkId>,
    pub requirements: Requirements,
    pub deleted: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Outcome of validating a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateCheck {
    New,
    AlreadyExists,
}

#[derive(Debug, Clone, Default)]
pub struct WorkLedger {
    items: IndexMap<WorkId, WorkItem>,
}

impl WorkLedger {
    pub fn get(&self, id: &WorkId) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn check_create(
        &self,
        id: &WorkId,
        title: &str,
        requirements: &Requirements,
    ) -> Result<CreateCheck, CoordError> {
        if id.as_str().trim().is_empty() {
            return Err(Violation::invalid("work_id", "must not be empty").into());
        }
        if title.trim().is_empty() {
            return Err(Violation::invalid("title", "must not be empty").into());
        }
        match self.items.get(id) {
            None => Ok(CreateCheck::New),
            Some(existing) if existing.title == title && &existing.requirements == requirements => {
                Ok(CreateCheck::AlreadyExists)
            }
            Some(_) => Err(IntegrityViolation::immutable(format!("work item {id}")).into()),
        }
    }

    /// Validate a dependency edge. Returns `false` when the edge already exists.
    pub(crate) fn check_dependency(
        &self,
        id: &WorkId,
        depends_on: &WorkId,
    ) -> Result<bool, CoordError> {
        for candidate in [id, depends_on] {
            match self.items.get(candidate) {
                None => {
                    return Err(Violation::WorkItemNotFound {
                        work_id: candidate.clone(),
                    }
                    .into());
                }
                Some(item) if item.deleted => {
                    return Err(Violation::missing(vec![Unmet::WorkItemDeleted {
                        work_id: candidate.clone(),
                    }])
                    .into());
                }
                Some(_) => {}
            }
        }
        if self.items[id].depends_on.contains(depends_on) {
            return Ok(false);
        }
        if self.would_cycle(id, depends_on) {
            return Err(IntegrityViolation::DependencyCycle {
                work_id: id.clone(),
                depends_on: depends_on.clone(),
            }
            .into());
        }
        Ok(true)
    }

    /// True when adding `id -> depends_on` would close a cycle.
    pub fn would_cycle(&self, id: &WorkId, depends_on: &WorkId) -> bool {
        if id == depends_on {
            return true;
        }
        let mut graph = DiGraphMap::<&str, ()>::new();
        for item in self.items.values() {
            graph.add_node(item.id.as_str());
            for dep in &item.depends_on {
                graph.add_edge(item.id.as_str(), dep.as_str(), ());
            }
        }
        graph.add_edge(id.as_str(), depends_on.as_str(), ());
        is_cyclic_directed(&graph)
    }

    /// Item-level reasons a claim cannot be granted, in a stable order.
    pub(crate) fn claim_blockers(&self, id: &WorkId) -> Vec<Unmet> {
        let Some(item) = self.items.get(id) else {
            return vec![Unmet::WorkItemNotFound {
                work_id: id.clone(),
            }];
        };
        let mut unmet = Vec::new();
        if item.deleted {
            unmet.push(Unmet::WorkItemDeleted {
                work_id: id.clone(),
            });
        }
        match item.status {
            WorkStatus::Completed => unmet.push(Unmet::WorkItemCompleted {
                work_id: id.clone(),
            }),
            WorkStatus::Deferred => unmet.push(Unmet::WorkItemDeferred {
                work_id: id.clone(),
            }),
            _ => {}
        }
        unmet.extend(self.unmet_dependencies(item));
        unmet
    }

    /// Dependencies that are neither completed nor soft-deleted.
    pub fn unmet_dependencies(&self, item: &WorkItem) -> Vec<Unmet> {
        item.depends_on
            .iter()
            .filter_map(|dep_id| match self.items.get(dep_id) {
                None => Some(Unmet::WorkItemNotFound {
                    work_id: dep_id.clone(),
                }),
                Some(dep) if dep.deleted || dep.status == WorkStatus::Completed => None,
                Some(dep) => Some(Unmet::Dependency {
                    work_id: dep_id.clone(),
                    status: dep.status,
                }),
            })
            .collect()
    }

    pub(crate) fn check_planning_change(
        &self,
        id: &WorkId,
        allowed: &[WorkStatus],
        field: &str,
    ) -> Result<&WorkItem, CoordError> {
        let item = self.items.get(id).ok_or_else(|| Violation::WorkItemNotFound {
            work_id: id.clone(),
        })?;
        if item.deleted {
            return Err(Violation::missing(vec![Unmet::WorkItemDeleted {
                work_id: id.clone(),
            }])
            .into());
        }
        if !allowed.contains(&item.status) {
            return Err(Violation::invalid(
                field,
                format!("work item {id} is {}", item.status.as_str()),
            )
            .into());
        }
        Ok(item)
    }

    pub(crate) fn apply_created(&mut self, record: &WorkItemCreatedRecord) {
        if self.items.contains_key(&record.work_id) {
            return;
        }
        self.items.insert(
            record.work_id.clone(),
            WorkItem {
                id: record.work_id.clone(),
                title: record.title.clone(),
                status: WorkStatus::Pending,
                depends_on: IndexSet::new(),
                requirements: record.requirements.clone(),
                deleted: false,
                created_at: record.created_at,
                updated_at: record.created_at,
            },
        );
    }

    pub(crate) fn apply_dependency(&mut self, record: &DependencyAddedRecord) {
        if let Some(item) = self.items.get_mut(&record.work_id) {
            item.depends_on.insert(record.depends_on.clone());
            item.updated_at = record.added_at;
        }
    }

    pub(crate) fn apply_deleted(&mut self, record: &WorkItemChangeRecord) {
        if let Some(item) = self.items.get_mut(&record.work_id) {
            item.deleted = true;
            item.updated_at = record.changed_at;
        }
    }

    pub(crate) fn set_status(&mut self, id: &WorkId, status: WorkStatus, at: Timestamp) {
        match self.items.get_mut(id) {
            Some(item) => {
                item.status = status;
                item.updated_at = at;
            }
            None => log::warn!("status change for unknown work item {id}"),
        }
    }
}
