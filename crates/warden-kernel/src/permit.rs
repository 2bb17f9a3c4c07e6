//! Permit authority: short-lived, single-use authorizations for side-effecting actions.
//!
//! A permit names one action against one target, is bound to the seal active when it was issued,
//! and expires within minutes. Authorization checks run in a fixed order and stop at the first
//! failure: exists, seal, expiry, action, constraints.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_canon::{CanonError, Hash};

use crate::clock::Timestamp;
use crate::error::KernelError;
use crate::ids::AttemptId;
use crate::signing::{KeySignature, PERMIT_DOMAIN, SealStrength, Signer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileWrite,
    FileDelete,
    CommandExec,
    NetworkRequest,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::FileWrite => "file_write",
            ActionKind::FileDelete => "file_delete",
            ActionKind::CommandExec => "command_exec",
            ActionKind::NetworkRequest => "network_request",
        }
    }
}

/// Limits enforced at authorization time. Unset limits do not apply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermitConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_operations: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_exit_codes: BTreeSet<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitRequest {
    pub action: ActionKind,
    pub target: String,
    #[serde(default)]
    pub constraints: PermitConstraints,
    /// Defaults to the configured permit TTL.
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

/// Signed and hashed content of a permit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitBody {
    pub seal_hash: Hash,
    pub attempt_id: AttemptId,
    pub action: ActionKind,
    pub target: String,
    pub constraints: PermitConstraints,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    /// Distinguishes otherwise identical permits.
    pub serial: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    /// Canonical hash of `body`.
    pub id: Hash,
    pub body: PermitBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<KeySignature>,
}

impl Permit {
    pub fn issue(
        body: PermitBody,
        strength: SealStrength,
        signer: Option<&Signer>,
    ) -> Result<Self, KernelError> {
        let id = Hash::of_json(&body)?;
        let signature = match (strength.requires_signature(), signer) {
            (true, Some(signer)) => Some(KeySignature::create(signer, PERMIT_DOMAIN, &id)),
            (true, None) => {
                return Err(KernelError::Signing(
                    "signed permit strength configured without a signing key".into(),
                ));
            }
            (false, _) => None,
        };
        Ok(Permit {
            id,
            body,
            signature,
        })
    }

    pub fn recompute_id(&self) -> Result<Hash, CanonError> {
        Hash::of_json(&self.body)
    }
}

/// An attempted side effect, presented with the permit the caller holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub permit: Option<Permit>,
    pub action: ActionKind,
    pub target: String,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum PermitDenial {
    #[serde(rename = "NO_PERMIT")]
    #[error("{reason}")]
    NoPermit { reason: String },
    #[serde(rename = "SEAL_MISMATCH")]
    #[error("permit bound to seal {permit_seal}, active seal is {}", fmt_seal(.active_seal))]
    SealMismatch {
        permit_seal: Hash,
        active_seal: Option<Hash>,
    },
    #[serde(rename = "PERMIT_EXPIRED")]
    #[error("permit expired at {expired_at}")]
    Expired { expired_at: Timestamp },
    #[serde(rename = "PERMIT_MISMATCH")]
    #[error("permit {field} is '{expected}', attempted '{found}'")]
    Mismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[serde(rename = "CONSTRAINT_VIOLATION")]
    #[error("{constraint}: {detail}")]
    ConstraintViolation { constraint: String, detail: String },
}

fn fmt_seal(seal: &Option<Hash>) -> String {
    seal.map(|hash| hash.to_hex())
        .unwrap_or_else(|| "none".to_string())
}

impl PermitDenial {
    pub fn code(&self) -> &'static str {
        match self {
            PermitDenial::NoPermit { .. } => "NO_PERMIT",
            PermitDenial::SealMismatch { .. } => "SEAL_MISMATCH",
            PermitDenial::Expired { .. } => "PERMIT_EXPIRED",
            PermitDenial::Mismatch { .. } => "PERMIT_MISMATCH",
            PermitDenial::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
        }
    }

    fn no_permit(reason: &str) -> Self {
        PermitDenial::NoPermit {
            reason: reason.to_string(),
        }
    }

    fn constraint(constraint: &str, detail: String) -> Self {
        PermitDenial::ConstraintViolation {
            constraint: constraint.to_string(),
            detail,
        }
    }
}

/// A refused side effect. Recorded in the run's evidence; never retried automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpermittedAttempt {
    pub attempt_id: AttemptId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_hash: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_id: Option<Hash>,
    pub action: ActionKind,
    pub target: String,
    pub code: String,
    pub detail: String,
    pub attempted_at: Timestamp,
}

/// Inputs to an authorization beyond the request itself.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationContext<'a> {
    pub active_seal: Option<Hash>,
    pub now: Timestamp,
    pub strength: SealStrength,
    pub trusted_key: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct PermitRegistry {
    permits: HashMap<Hash, Permit>,
    consumed: HashSet<Hash>,
    unpermitted: Vec<UnpermittedAttempt>,
    issued: u64,
}

impl PermitRegistry {
    pub fn get(&self, id: &Hash) -> Option<&Permit> {
        self.permits.get(id)
    }

    pub fn is_consumed(&self, id: &Hash) -> bool {
        self.consumed.contains(id)
    }

    pub fn unpermitted_for(&self, attempt_id: AttemptId) -> Vec<&UnpermittedAttempt> {
        self.unpermitted
            .iter()
            .filter(|entry| entry.attempt_id == attempt_id)
            .collect()
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.issued + 1
    }

    /// Run every check in order and return the registered permit on success.
    pub fn authorize(
        &self,
        request: &ActionRequest,
        ctx: &AuthorizationContext<'_>,
    ) -> Result<&Permit, PermitDenial> {
        let presented = request
            .permit
            .as_ref()
            .ok_or_else(|| PermitDenial::no_permit("no permit presented"))?;
        if ctx.strength.checks_hash() {
            match presented.recompute_id() {
                Ok(id) if id == presented.id => {}
                _ => return Err(PermitDenial::no_permit("permit body does not match its id")),
            }
        }
        let permit = self
            .permits
            .get(&presented.id)
            .ok_or_else(|| PermitDenial::no_permit("permit was not issued by this kernel"))?;
        if self.consumed.contains(&permit.id) {
            return Err(PermitDenial::no_permit("permit already consumed"));
        }
        if ctx.strength.requires_signature() {
            let valid = match (&presented.signature, ctx.trusted_key) {
                (Some(sig), Some(key)) => {
                    sig.public_key == key && sig.verify(PERMIT_DOMAIN, &permit.id)
                }
                _ => false,
            };
            if !valid {
                return Err(PermitDenial::no_permit("permit signature invalid"));
            }
        }

        if ctx.active_seal != Some(permit.body.seal_hash) {
            return Err(PermitDenial::SealMismatch {
                permit_seal: permit.body.seal_hash,
                active_seal: ctx.active_seal,
            });
        }

        if ctx.now >= permit.body.expires_at {
            return Err(PermitDenial::Expired {
                expired_at: permit.body.expires_at,
            });
        }

        if request.action != permit.body.action {
            return Err(PermitDenial::Mismatch {
                field: "action".into(),
                expected: permit.body.action.as_str().into(),
                found: request.action.as_str().into(),
            });
        }
        if request.target != permit.body.target {
            return Err(PermitDenial::Mismatch {
                field: "target".into(),
                expected: permit.body.target.clone(),
                found: request.target.clone(),
            });
        }

        check_constraints(&permit.body.constraints, request)?;
        Ok(permit)
    }

    pub(crate) fn apply_issued(&mut self, permit: &Permit) {
        self.issued = self.issued.max(permit.body.serial);
        self.permits
            .entry(permit.id)
            .or_insert_with(|| permit.clone());
    }

    pub(crate) fn apply_consumed(&mut self, permit_id: Hash) {
        self.consumed.insert(permit_id);
    }

    pub(crate) fn apply_denied(&mut self, entry: &UnpermittedAttempt) {
        self.unpermitted.push(entry.clone());
    }
}

/// Constraints fail closed: a limit the request does not declare a value for is violated.
fn check_constraints(
    constraints: &PermitConstraints,
    request: &ActionRequest,
) -> Result<(), PermitDenial> {
    if let Some(max) = constraints.max_bytes {
        match request.bytes {
            Some(bytes) if bytes <= max => {}
            Some(bytes) => {
                return Err(PermitDenial::constraint(
                    "max_bytes",
                    format!("{bytes} bytes exceeds limit of {max}"),
                ));
            }
            None => {
                return Err(PermitDenial::constraint(
                    "max_bytes",
                    "request does not declare its size".into(),
                ));
            }
        }
    }
    if !constraints.allowed_operations.is_empty() {
        match &request.operation {
            Some(op) if constraints.allowed_operations.contains(op) => {}
            Some(op) => {
                return Err(PermitDenial::constraint(
                    "allowed_operations",
                    format!("operation '{op}' is not allowed"),
                ));
            }
            None => {
                return Err(PermitDenial::constraint(
                    "allowed_operations",
                    "request does not name an operation".into(),
                ));
            }
        }
    }
    if let Some(limit) = constraints.timeout_secs {
        match request.timeout_secs {
            Some(timeout) if timeout <= limit => {}
            Some(timeout) => {
                return Err(PermitDenial::constraint(
                    "timeout_secs",
                    format!("timeout {timeout}s exceeds limit of {limit}s"),
                ));
            }
            None => {
                return Err(PermitDenial::constraint(
                    "timeout_secs",
                    "request does not declare a timeout".into(),
                ));
            }
        }
    }
    if let Some(code) = request.exit_code {
        if !constraints.allowed_exit_codes.is_empty()
            && !constraints.allowed_exit_codes.contains(&code)
        {
            return Err(PermitDenial::constraint(
                "allowed_exit_codes",
                format!("exit code {code} is not allowed"),
            ));
        }
    }
    Ok(())
}
