//! Attempt contracts: the standards and requirements in force when an attempt was claimed.
//!
//! A contract is compiled from the configured [`StandardsCatalog`] plus the work item's
//! [`Requirements`], then stored content-addressed. Identical inputs compile to the same hash;
//! changed requirements produce a new contract and never touch the old one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use warden_canon::{CANONICAL_VERSION, CanonError, Hash};

use crate::error::Unmet;
use crate::ledger::WorkItem;
use crate::records::ArtifactKind;

pub const CONTRACT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standard {
    pub id: String,
    pub text: String,
    /// Mandatory standards apply to every contract.
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardsCatalog {
    pub standards: Vec<Standard>,
    pub required_gates: Vec<String>,
    pub required_evidence: Vec<ArtifactKind>,
    pub policy_versions: BTreeMap<String, String>,
}

impl StandardsCatalog {
    pub fn standard(&self, id: &str) -> Option<&Standard> {
        self.standards.iter().find(|standard| standard.id == id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub schema_version: u32,
    pub canonical_version: String,
    pub work_id: String,
    pub title: String,
    pub standards: Vec<Standard>,
    pub scope: BTreeSet<String>,
    pub required_gates: BTreeSet<String>,
    pub required_evidence: BTreeSet<ArtifactKind>,
    pub policy_versions: BTreeMap<String, String>,
}

impl Contract {
    /// Merge catalog and item requirements. Unknown standard ids are returned as unmet.
    pub fn compile(catalog: &StandardsCatalog, item: &WorkItem) -> Result<Self, Vec<Unmet>> {
        let mut standards: Vec<Standard> = catalog
            .standards
            .iter()
            .filter(|standard| standard.mandatory)
            .cloned()
            .collect();
        let mut unmet = Vec::new();
        for id in &item.requirements.standards {
            match catalog.standard(id) {
                Some(standard) if !standards.iter().any(|s| &s.id == id) => {
                    standards.push(standard.clone())
                }
                Some(_) => {}
                None => unmet.push(Unmet::Standard { id: id.clone() }),
            }
        }
        if !unmet.is_empty() {
            return Err(unmet);
        }
        standards.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Contract {
            schema_version: CONTRACT_SCHEMA_VERSION,
            canonical_version: CANONICAL_VERSION.to_string(),
            work_id: item.id.to_string(),
            title: item.title.clone(),
            standards,
            scope: item.requirements.scope.iter().cloned().collect(),
            required_gates: catalog
                .required_gates
                .iter()
                .chain(&item.requirements.required_gates)
                .cloned()
                .collect(),
            required_evidence: catalog
                .required_evidence
                .iter()
                .chain(&item.requirements.required_evidence)
                .copied()
                .collect(),
            policy_versions: catalog.policy_versions.clone(),
        })
    }

    pub fn hash(&self) -> Result<Hash, CanonError> {
        Hash::of_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorkId;
    use crate::ledger::{Requirements, WorkStatus};
    use indexmap::IndexSet;

    fn item(requirements: Requirements) -> WorkItem {
        WorkItem {
            id: WorkId::from("W1"),
            title: "Add retry".into(),
            status: WorkStatus::Pending,
            depends_on: IndexSet::new(),
            requirements,
            deleted: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn catalog() -> StandardsCatalog {
        StandardsCatalog {
            standards: vec![
                Standard {
                    id: "tests".into(),
                    text: "Every change ships with tests".into(),
                    mandatory: true,
                },
                Standard {
                    id: "docs".into(),
                    text: "Public APIs are documented".into(),
                    mandatory: false,
                },
            ],
            required_gates: vec!["lint".into()],
            required_evidence: vec![ArtifactKind::TestResult],
            policy_versions: BTreeMap::from([("gates".to_string(), "v2".to_string())]),
        }
    }

    #[test]
    fn merges_catalog_and_item_requirements() {
        let contract = Contract::compile(
            &catalog(),
            &item(Requirements {
                scope: vec!["src/**".into()],
                required_gates: vec!["unit".into(), "lint".into()],
                required_evidence: vec![ArtifactKind::Diff],
                standards: vec!["docs".into()],
            }),
        )
        .unwrap();
        let ids: Vec<_> = contract.standards.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["docs", "tests"]);
        assert_eq!(
            contract.required_gates.iter().collect::<Vec<_>>(),
            vec!["lint", "unit"]
        );
        assert!(contract.required_evidence.contains(&ArtifactKind::Diff));
        assert!(contract.required_evidence.contains(&ArtifactKind::TestResult));
    }

    #[test]
    fn identical_inputs_share_a_hash() {
        let a = Contract::compile(&catalog(), &item(Requirements::default())).unwrap();
        let b = Contract::compile(&catalog(), &item(Requirements::default())).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());

        let changed = Contract::compile(
            &catalog(),
            &item(Requirements {
                scope: vec!["docs/**".into()],
                ..Requirements::default()
            }),
        )
        .unwrap();
        assert_ne!(a.hash().unwrap(), changed.hash().unwrap());
    }

    #[test]
    fn unknown_standards_are_unmet() {
        let err = Contract::compile(
            &catalog(),
            &item(Requirements {
                standards: vec!["security".into()],
                ..Requirements::default()
            }),
        )
        .unwrap_err();
        assert_eq!(err, vec![Unmet::Standard { id: "security".into() }]);
    }
}
