use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contract::StandardsCatalog;
use crate::signing::SealStrength;

pub const DEFAULT_TARGET_REF: &str = "refs/heads/main";
/// Permits are measured in minutes; this caps any configured ttl.
pub const PERMIT_TTL_CEILING_MINUTES: u32 = 60;
/// Gate exceptions never outlive a week.
pub const EXCEPTION_TTL_CEILING_MINUTES: u32 = 7 * 24 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub workspace_id: String,
    pub lease_ttl_secs: u64,
    pub permit_ttl_minutes: u32,
    pub max_permit_ttl_minutes: u32,
    /// Longest lifetime a granted gate exception may ask for.
    pub max_exception_ttl_minutes: u32,
    pub seal_strength: SealStrength,
    /// Manifests must carry a valid signature to verify.
    pub signature_required: bool,
    pub target_ref: String,
    /// Finalized bundles are also written under `<bundle_root>/<run_id>/` when set.
    pub bundle_root: Option<PathBuf>,
    /// Hex ed25519 seed for the kernel signing key.
    pub signing_seed_hex: Option<String>,
    /// Hex ed25519 public keys allowed to attest a ref head.
    pub trusted_attesters: Vec<String>,
    pub standards: StandardsCatalog,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            workspace_id: "local".into(),
            lease_ttl_secs: 30 * 60,
            permit_ttl_minutes: 10,
            max_permit_ttl_minutes: 30,
            max_exception_ttl_minutes: 24 * 60,
            seal_strength: SealStrength::HashOnly,
            signature_required: false,
            target_ref: DEFAULT_TARGET_REF.into(),
            bundle_root: None,
            signing_seed_hex: None,
            trusted_attesters: Vec::new(),
            standards: StandardsCatalog::default(),
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `WARDEN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_lookup(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("WARDEN_WORKSPACE_ID") {
            self.workspace_id = value;
        }
        if let Some(value) = lookup("WARDEN_LEASE_TTL_SECS") {
            self.lease_ttl_secs = parse_number("WARDEN_LEASE_TTL_SECS", &value)?;
        }
        if let Some(value) = lookup("WARDEN_PERMIT_TTL_MINUTES") {
            self.permit_ttl_minutes = parse_number("WARDEN_PERMIT_TTL_MINUTES", &value)?;
        }
        if let Some(value) = lookup("WARDEN_MAX_PERMIT_TTL_MINUTES") {
            self.max_permit_ttl_minutes = parse_number("WARDEN_MAX_PERMIT_TTL_MINUTES", &value)?;
        }
        if let Some(value) = lookup("WARDEN_MAX_EXCEPTION_TTL_MINUTES") {
            self.max_exception_ttl_minutes =
                parse_number("WARDEN_MAX_EXCEPTION_TTL_MINUTES", &value)?;
        }
        if let Some(value) = lookup("WARDEN_SEAL_STRENGTH") {
            self.seal_strength = value.parse().map_err(|reason: String| {
                ConfigError::invalid("WARDEN_SEAL_STRENGTH", &value, reason)
            })?;
        }
        if let Some(value) = lookup("WARDEN_SIGNATURE_REQUIRED") {
            self.signature_required = parse_bool("WARDEN_SIGNATURE_REQUIRED", &value)?;
        }
        if let Some(value) = lookup("WARDEN_TARGET_REF") {
            self.target_ref = value;
        }
        if let Some(value) = lookup("WARDEN_BUNDLE_ROOT") {
            self.bundle_root = (!value.trim().is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = lookup("WARDEN_SIGNING_SEED") {
            self.signing_seed_hex = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_id.trim().is_empty() {
            return Err(ConfigError::invalid("workspace_id", "", "must not be empty"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::invalid("lease_ttl_secs", 0, "must be positive"));
        }
        if self.max_permit_ttl_minutes == 0
            || self.max_permit_ttl_minutes > PERMIT_TTL_CEILING_MINUTES
        {
            return Err(ConfigError::invalid(
                "max_permit_ttl_minutes",
                self.max_permit_ttl_minutes,
                format!("must be between 1 and {PERMIT_TTL_CEILING_MINUTES}"),
            ));
        }
        if self.permit_ttl_minutes == 0 || self.permit_ttl_minutes > self.max_permit_ttl_minutes {
            return Err(ConfigError::invalid(
                "permit_ttl_minutes",
                self.permit_ttl_minutes,
                format!("must be between 1 and {}", self.max_permit_ttl_minutes),
            ));
        }
        if self.max_exception_ttl_minutes == 0
            || self.max_exception_ttl_minutes > EXCEPTION_TTL_CEILING_MINUTES
        {
            return Err(ConfigError::invalid(
                "max_exception_ttl_minutes",
                self.max_exception_ttl_minutes,
                format!("must be between 1 and {EXCEPTION_TTL_CEILING_MINUTES}"),
            ));
        }
        if !self.target_ref.starts_with("refs/") && self.target_ref != "HEAD" {
            return Err(ConfigError::invalid(
                "target_ref",
                &self.target_ref,
                "must be HEAD or start with refs/",
            ));
        }
        for key in &self.trusted_attesters {
            let valid = key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::invalid(
                    "trusted_attesters",
                    key,
                    "expected a 64-character hex ed25519 key",
                ));
            }
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl_secs.saturating_mul(1000)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::invalid(key, value, err.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn invalid_key(err: &ConfigError) -> &str {
        match err {
            ConfigError::Invalid { key, .. } => key,
            other => panic!("expected an invalid value, got {other}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = KernelConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.lease_ttl(), Duration::from_secs(1800));
        assert_eq!(config.seal_strength, SealStrength::HashOnly);
    }

    #[test]
    fn env_overrides() {
        let config = KernelConfig::from_lookup(lookup(&[
            ("WARDEN_WORKSPACE_ID", "repo-a"),
            ("WARDEN_LEASE_TTL_SECS", "60"),
            ("WARDEN_PERMIT_TTL_MINUTES", "5"),
            ("WARDEN_SEAL_STRENGTH", "signed"),
            ("WARDEN_SIGNATURE_REQUIRED", "yes"),
            ("WARDEN_BUNDLE_ROOT", "/tmp/bundles"),
        ]))
        .unwrap();
        assert_eq!(config.workspace_id, "repo-a");
        assert_eq!(config.lease_ttl_ms(), 60_000);
        assert_eq!(config.permit_ttl_minutes, 5);
        assert_eq!(config.seal_strength, SealStrength::Signed);
        assert!(config.signature_required);
        assert_eq!(config.bundle_root, Some(PathBuf::from("/tmp/bundles")));
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = KernelConfig::from_lookup(lookup(&[("WARDEN_LEASE_TTL_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(invalid_key(&err), "WARDEN_LEASE_TTL_SECS");

        let err = KernelConfig::from_lookup(lookup(&[("WARDEN_PERMIT_TTL_MINUTES", "45")]))
            .unwrap_err();
        assert_eq!(invalid_key(&err), "permit_ttl_minutes");

        let err = KernelConfig::from_lookup(lookup(&[("WARDEN_MAX_PERMIT_TTL_MINUTES", "120")]))
            .unwrap_err();
        assert_eq!(invalid_key(&err), "max_permit_ttl_minutes");

        let err =
            KernelConfig::from_lookup(lookup(&[("WARDEN_SEAL_STRENGTH", "maximal")])).unwrap_err();
        assert_eq!(invalid_key(&err), "WARDEN_SEAL_STRENGTH");
    }

    #[test]
    fn exception_ttl_is_bounded() {
        let key = "WARDEN_MAX_EXCEPTION_TTL_MINUTES";
        let config = KernelConfig::from_lookup(lookup(&[(key, "90")])).unwrap();
        assert_eq!(config.max_exception_ttl_minutes, 90);

        for value in ["0", "100000"] {
            let err = KernelConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert_eq!(invalid_key(&err), "max_exception_ttl_minutes");
        }
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("warden.json");
        let json = r#"{"workspace_id":"ci","seal_strength":"none","#.to_string()
            + r#""standards":{"required_gates":["unit"]}}"#;
        fs::write(&path, json).unwrap();
        let config = KernelConfig::from_json_file(&path).unwrap();
        assert_eq!(config.workspace_id, "ci");
        assert_eq!(config.seal_strength, SealStrength::None);
        assert_eq!(config.standards.required_gates, vec!["unit".to_string()]);
        assert_eq!(config.lease_ttl_secs, 1800);

        assert!(matches!(
            KernelConfig::from_json_file(tmp.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
