//! Security configuration for certificate authorities and clients.
//!
//! Settings are read from a TOML file. Every field has a default so a partial
//! file (or none at all) yields a usable configuration.

use crate::error::{PkiError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest certificate validity accepted in any configuration (100 years).
pub const CERTIFICATE_DURATION_LIMIT_SECS: u64 = 100 * 365 * 86400;

/// Lifecycle, renewal and file layout settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Root directory holding every component's key material.
    pub metadata_dir: PathBuf,

    /// Upper bound for any certificate validity, including the root (seconds).
    pub max_certificate_duration_secs: u64,

    /// Validity requested for node certificates (seconds).
    pub default_certificate_duration_secs: u64,

    /// Renewal starts this long before a certificate's notAfter (seconds).
    pub renewal_grace_period_secs: u64,

    /// How often the renewal service re-evaluates expiry (seconds).
    pub renewal_check_interval_secs: u64,

    /// Consecutive renewal failures tolerated before health escalation.
    pub renewal_max_consecutive_failures: u32,

    /// Interval between root CA set fetches (seconds).
    pub root_ca_polling_interval_secs: u64,

    /// Bound on waiting for background tasks during close (seconds).
    pub shutdown_timeout_secs: u64,

    /// Serial number given to a freshly self-signed root.
    pub root_ca_serial: u64,

    /// Component name under which the CA keeps its material.
    pub ca_component_name: String,

    /// Externally issued root certificate to import instead of self-signing.
    pub external_root_ca_cert: Option<PathBuf>,

    /// PKCS#8 private key matching `external_root_ca_cert`.
    pub external_root_ca_private_key: Option<PathBuf>,

    /// Optional SPKI public key file; derived from the certificate when absent.
    pub external_root_ca_public_key: Option<PathBuf>,

    pub private_key_file_name: String,
    pub public_key_file_name: String,
    pub certificate_file_name: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("metadata"),
            max_certificate_duration_secs: 5 * 365 * DAY,
            default_certificate_duration_secs: 365 * DAY,
            renewal_grace_period_secs: 28 * DAY,
            renewal_check_interval_secs: DAY,
            renewal_max_consecutive_failures: 5,
            root_ca_polling_interval_secs: 2 * 60 * 60,
            shutdown_timeout_secs: 5,
            root_ca_serial: 1,
            ca_component_name: String::from("ca"),
            external_root_ca_cert: None,
            external_root_ca_private_key: None,
            external_root_ca_public_key: None,
            private_key_file_name: String::from("private.pem"),
            public_key_file_name: String::from("public.pem"),
            certificate_file_name: String::from("certificate.crt"),
        }
    }
}

const DAY: u64 = 24 * 60 * 60;

impl SecurityConfig {
    /// Create a configuration rooted at `metadata_dir` with default settings.
    pub fn with_metadata_dir(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PkiError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file, falling back to defaults when the file is absent.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PkiError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_certificate_duration_secs > CERTIFICATE_DURATION_LIMIT_SECS {
            return Err(PkiError::Config(format!(
                "maximum certificate duration ({}s) exceeds the limit of {}s",
                self.max_certificate_duration_secs, CERTIFICATE_DURATION_LIMIT_SECS
            )));
        }
        if self.renewal_grace_period_secs >= self.max_certificate_duration_secs {
            return Err(PkiError::Config(format!(
                "renewal grace period ({}s) must be shorter than the maximum certificate duration ({}s)",
                self.renewal_grace_period_secs, self.max_certificate_duration_secs
            )));
        }
        if self.default_certificate_duration_secs > self.max_certificate_duration_secs {
            return Err(PkiError::Config(
                "default certificate duration exceeds the maximum".to_string(),
            ));
        }
        if self.renewal_check_interval_secs == 0 || self.root_ca_polling_interval_secs == 0 {
            return Err(PkiError::Config(
                "check and polling intervals must be non-zero".to_string(),
            ));
        }
        if self.external_root_ca_cert.is_some() != self.external_root_ca_private_key.is_some() {
            return Err(PkiError::Config(
                "external root CA certificate and private key must be configured together"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_certificate_duration(&self) -> Duration {
        Duration::from_secs(self.max_certificate_duration_secs)
    }

    pub fn default_certificate_duration(&self) -> Duration {
        Duration::from_secs(self.default_certificate_duration_secs)
    }

    pub fn renewal_grace_period(&self) -> Duration {
        Duration::from_secs(self.renewal_grace_period_secs)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs)
    }

    pub fn root_ca_polling_interval(&self) -> Duration {
        Duration::from_secs(self.root_ca_polling_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// True when an external root certificate and key are configured.
    pub fn uses_external_root_ca(&self) -> bool {
        self.external_root_ca_cert.is_some() && self.external_root_ca_private_key.is_some()
    }
}

/// On-disk layout of one component's identity.
///
/// `identity` holds the active material, `identity-new` is the staging area
/// used while renewing and `identity-backup` keeps the previous generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLayout {
    pub identity_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub trust_dir: PathBuf,
    pub private_key_file_name: String,
    pub public_key_file_name: String,
    pub certificate_file_name: String,
}

/// Name of the persisted identity record inside the identity directory.
pub const IDENTITY_RECORD_FILE: &str = "identity.json";

impl IdentityLayout {
    /// Default layout: `<metadata_dir>/<component>/{identity, identity-new, identity-backup, trust}`.
    pub fn for_component(config: &SecurityConfig, component: &str) -> Self {
        let home = config.metadata_dir.join(component);
        let identity_dir = home.join("identity");
        Self {
            staging_dir: sibling(&identity_dir, "-new"),
            backup_dir: sibling(&identity_dir, "-backup"),
            identity_dir,
            trust_dir: home.join("trust"),
            private_key_file_name: config.private_key_file_name.clone(),
            public_key_file_name: config.public_key_file_name.clone(),
            certificate_file_name: config.certificate_file_name.clone(),
        }
    }

    pub fn private_key_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.private_key_file_name)
    }

    pub fn public_key_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.public_key_file_name)
    }

    pub fn certificate_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.certificate_file_name)
    }

    pub fn record_path(&self, dir: &Path) -> PathBuf {
        dir.join(IDENTITY_RECORD_FILE)
    }
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    dir.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SecurityConfig::default();
        assert_eq!(config.renewal_grace_period_secs, 28 * DAY);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.private_key_file_name, "private.pem");
        assert!(!config.uses_external_root_ca());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SecurityConfig::from_toml_str(
            r#"
            metadata_dir = "/var/lib/cluster"
            renewal_grace_period_secs = 3600
            "#,
        )
        .unwrap();

        assert_eq!(config.metadata_dir, PathBuf::from("/var/lib/cluster"));
        assert_eq!(config.renewal_grace_period(), Duration::from_secs(3600));
        assert_eq!(config.certificate_file_name, "certificate.crt");
    }

    #[test]
    fn test_grace_period_must_be_shorter_than_max_duration() {
        let result = SecurityConfig::from_toml_str(
            r#"
            max_certificate_duration_secs = 100
            default_certificate_duration_secs = 50
            renewal_grace_period_secs = 100
            "#,
        );

        match result {
            Err(PkiError::Config(msg)) => assert!(msg.contains("grace period")),
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn test_oversized_max_duration_is_rejected() {
        let result = SecurityConfig::from_toml_str(&format!(
            "max_certificate_duration_secs = {}",
            i64::MAX
        ));
        match result {
            Err(PkiError::Config(msg)) => assert!(msg.contains("exceeds the limit")),
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn test_external_root_requires_key() {
        let result = SecurityConfig::from_toml_str(r#"external_root_ca_cert = "/tmp/root.crt""#);
        assert!(matches!(result, Err(PkiError::Config(_))));
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("security.toml");

        let mut config = SecurityConfig::with_metadata_dir(temp_dir.path());
        config.renewal_max_consecutive_failures = 3;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SecurityConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded, config);

        let missing = SecurityConfig::from_toml_file(&temp_dir.path().join("none.toml")).unwrap();
        assert_eq!(missing, SecurityConfig::default());
    }

    #[test]
    fn test_identity_layout() {
        let config = SecurityConfig::with_metadata_dir("/data");
        let layout = IdentityLayout::for_component(&config, "datanode");

        assert_eq!(layout.identity_dir, PathBuf::from("/data/datanode/identity"));
        assert_eq!(layout.staging_dir, PathBuf::from("/data/datanode/identity-new"));
        assert_eq!(layout.backup_dir, PathBuf::from("/data/datanode/identity-backup"));
        assert_eq!(layout.trust_dir, PathBuf::from("/data/datanode/trust"));
        assert_eq!(
            layout.certificate_path(&layout.identity_dir),
            PathBuf::from("/data/datanode/identity/certificate.crt")
        );
    }
}
