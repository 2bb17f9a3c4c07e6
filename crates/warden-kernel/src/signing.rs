//! Seal strength levels and ed25519 signing for seals, permits, manifests and head attestations.
//!
//! Signatures cover a domain-separated preimage (`domain || 0x00 || hash`) so a signature made
//! for one record type can never be replayed as another.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use warden_canon::Hash;

use crate::error::KernelError;

pub const SEAL_DOMAIN: &str = "warden.plan_seal.v1";
pub const PERMIT_DOMAIN: &str = "warden.permit.v1";
pub const MANIFEST_DOMAIN: &str = "warden.run_manifest.v1";
pub const HEAD_DOMAIN: &str = "warden.head_attestation.v1";

/// How strongly seals and permits are protected against forgery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealStrength {
    /// Records are trusted as stored.
    None,
    /// Record ids are recomputed from content on every use.
    #[default]
    HashOnly,
    /// Hash checks plus an ed25519 signature by the kernel key.
    Signed,
}

impl SealStrength {
    pub fn checks_hash(&self) -> bool {
        !matches!(self, SealStrength::None)
    }

    pub fn requires_signature(&self) -> bool {
        matches!(self, SealStrength::Signed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SealStrength::None => "none",
            SealStrength::HashOnly => "hash_only",
            SealStrength::Signed => "signed",
        }
    }
}

impl FromStr for SealStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SealStrength::None),
            "hash_only" | "hash-only" | "hash" => Ok(SealStrength::HashOnly),
            "signed" => Ok(SealStrength::Signed),
            other => Err(format!("unknown seal strength '{other}'")),
        }
    }
}

/// ed25519 signing key held by the kernel.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn generate() -> Result<Self, KernelError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|err| KernelError::Signing(format!("entropy unavailable: {err}")))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, KernelError> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(seed_hex.trim(), &mut seed)
            .map_err(|err| KernelError::Signing(format!("invalid signing seed: {err}")))?;
        Ok(Self::from_seed(seed))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Sign `subject` under `domain`, returning the signature as hex.
    pub fn sign(&self, domain: &str, subject: &Hash) -> String {
        let signature = self.key.sign(&preimage(domain, subject));
        hex::encode(signature.to_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Public key plus signature, both hex, as embedded in signed records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    pub public_key: String,
    pub signature: String,
}

impl KeySignature {
    pub fn create(signer: &Signer, domain: &str, subject: &Hash) -> Self {
        Self {
            public_key: signer.public_key_hex(),
            signature: signer.sign(domain, subject),
        }
    }

    pub fn verify(&self, domain: &str, subject: &Hash) -> bool {
        verify_signature(domain, &self.public_key, subject, &self.signature)
    }
}

/// Check a hex signature over `subject` under `domain`. Malformed keys or signatures are invalid.
pub fn verify_signature(
    domain: &str,
    public_key_hex: &str,
    subject: &Hash,
    signature_hex: &str,
) -> bool {
    let mut key_bytes = [0u8; 32];
    if hex::decode_to_slice(public_key_hex, &mut key_bytes).is_err() {
        return false;
    }
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(&preimage(domain, subject), &signature).is_ok()
}

fn preimage(domain: &str, subject: &Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + 1 + 32);
    buf.extend_from_slice(domain.as_bytes());
    buf.push(0);
    buf.extend_from_slice(subject.as_bytes());
    buf
}
