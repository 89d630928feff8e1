//! Client configuration.

use serde::{Deserialize, Serialize};

/// Default number of whole-batch ingest retries on ordering failures.
pub const DEFAULT_INGEST_MAX_RETRIES: u32 = 3;

/// Default key package lifetime: 90 days.
pub const DEFAULT_KEY_PACKAGE_LIFETIME_SECONDS: u64 = 7_776_000;

/// Behavior when a commit sender's leaf cannot be resolved to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnUnverifiableCommit {
    /// Drop the commit without advancing state.
    #[default]
    Reject,
    /// Apply the commit anyway.
    Accept,
}

/// Tunables recognized by the core. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Retries of a whole ingest batch on ordering-related failures.
    pub ingest_max_retries: u32,
    /// Policy for commits whose sender cannot be resolved.
    pub on_unverifiable_commit: OnUnverifiableCommit,
    /// Lifetime window for newly generated key packages.
    pub key_package_lifetime_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest_max_retries: DEFAULT_INGEST_MAX_RETRIES,
            on_unverifiable_commit: OnUnverifiableCommit::default(),
            key_package_lifetime_seconds: DEFAULT_KEY_PACKAGE_LIFETIME_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ingest_max_retries, 3);
        assert_eq!(config.on_unverifiable_commit, OnUnverifiableCommit::Reject);
        assert_eq!(config.key_package_lifetime_seconds, 7_776_000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"ingest_max_retries": 5}"#).unwrap();
        assert_eq!(config.ingest_max_retries, 5);
        assert_eq!(config.on_unverifiable_commit, OnUnverifiableCommit::Reject);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: std::result::Result<Config, _> =
            serde_json::from_str(r#"{"ingest_max_retries": 5, "surprise": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_accept_policy_parses() {
        let config: Config =
            serde_json::from_str(r#"{"on_unverifiable_commit": "accept"}"#).unwrap();
        assert_eq!(config.on_unverifiable_commit, OnUnverifiableCommit::Accept);
    }
}
