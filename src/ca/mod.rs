//! Certificate authority.
//!
//! A [`CertificateAuthority`] owns a signing key and a CA certificate. A root
//! authority either self-signs its certificate or imports an externally
//! issued one; a subordinate authority has its certificate issued by a parent.
//! Issued certificates are kept in memory and in the `issued/` directory of
//! the authority's home, serials are allocated monotonically and persisted in
//! `ca-state.json` together with the revocation list.
//!
//! # Example
//!
//! ```rust
//! use cluster_pki::ca::CertificateAuthority;
//! use cluster_pki::cert::chain::CertRole;
//! use cluster_pki::cert::csr::build_csr;
//! use cluster_pki::config::SecurityConfig;
//! use cluster_pki::crypto::ed25519::generate_ed25519_keypair;
//!
//! # fn example() -> cluster_pki::error::Result<()> {
//! let dir = tempfile::TempDir::new()?;
//! let config = SecurityConfig::with_metadata_dir(dir.path());
//! let ca = CertificateAuthority::bootstrap_root(&config, "CN=Cluster Root CA")?;
//!
//! let node_keys = generate_ed25519_keypair()?;
//! let csr = build_csr(&node_keys, "CN=datanode-1", CertRole::Leaf, &[])?;
//! let chain = ca.issue_chain(&csr, config.default_certificate_duration(), CertRole::Leaf)?;
//! assert_eq!(chain.len(), 2);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod revocation;

use crate::cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
use crate::cert::codec;
use crate::cert::csr::{build_csr, parse_csr};
use crate::cert::profile::{DefaultProfile, PkiProfile};
use crate::cert::x509_signing::{create_root_certificate, sign_certificate, CertificateParams};
use crate::clock::{Clock, SystemClock};
use crate::config::SecurityConfig;
use crate::crypto::ed25519::{generate_ed25519_keypair, Keypair};
use crate::error::{PkiError, Result};
use crate::storage::cert_storage::{write_restricted, CertificateStorage};
use crate::storage::keystore::KeyFiles;
use crate::storage::trusted::TrustedCertStorage;
pub use revocation::{RevocationList, RevocationReason, RevokedEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use x509_cert::certificate::Certificate;

const CA_STATE_FILE: &str = "ca-state.json";
const CA_CHAIN_FILE: &str = "ca-chain.crt";

/// Serial allocation and revocation state that survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    last_serial: SerialId,
    crl: RevocationList,
}

#[derive(Debug)]
struct CaState {
    last_serial: SerialId,
    issued: BTreeMap<SerialId, (CertRole, Certificate)>,
    crl: RevocationList,
}

/// Directory layout of an authority's home.
#[derive(Debug, Clone)]
struct CaPaths {
    home: PathBuf,
    keys: KeyFiles,
    trust: TrustedCertStorage,
    issued: CertificateStorage,
}

impl CaPaths {
    fn new(config: &SecurityConfig, component: &str) -> Self {
        let home = config.metadata_dir.join(component);
        let key_dir = home.join("keys");
        Self {
            keys: KeyFiles::new(
                key_dir.join(&config.private_key_file_name),
                key_dir.join(&config.public_key_file_name),
            ),
            trust: TrustedCertStorage::new(home.join("trust")),
            issued: CertificateStorage::new(home.join("issued")),
            home,
        }
    }

    fn chain_path(&self) -> PathBuf {
        self.home.join(CA_CHAIN_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.home.join(CA_STATE_FILE)
    }
}

/// A root or subordinate certificate authority.
pub struct CertificateAuthority {
    component: String,
    keypair: Keypair,
    ca_chain: CertificateChain,
    root: Certificate,
    max_duration: Duration,
    paths: CaPaths,
    profile: Arc<dyn PkiProfile>,
    clock: Arc<dyn Clock>,
    state: RwLock<CaState>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("component", &self.component)
            .field("serial", &self.certificate().serial_id())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Bring up the root authority with the default profile and system clock.
    pub fn bootstrap_root(config: &SecurityConfig, subject: &str) -> Result<Self> {
        Self::bootstrap_root_with(
            config,
            subject,
            Arc::new(DefaultProfile),
            Arc::new(SystemClock),
        )
    }

    /// Bring up the root authority.
    ///
    /// Existing material in the authority's home is reused. Otherwise an
    /// external root is imported when one is configured, and a self-signed
    /// root is created when not. Either way the installed root must verify
    /// against its own key.
    pub fn bootstrap_root_with(
        config: &SecurityConfig,
        subject: &str,
        profile: Arc<dyn PkiProfile>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let component = config.ca_component_name.clone();
        let paths = CaPaths::new(config, &component);

        let (keypair, ca_chain) = match load_material(&paths)? {
            Some(material) => {
                info!(component = %component, "loaded existing CA material");
                material
            }
            None if config.uses_external_root_ca() => {
                let material = import_external(config)?;
                persist_material(&paths, &material.0, &material.1)?;
                info!(
                    component = %component,
                    serial = %material.1.leaf().serial_id(),
                    "imported external root CA"
                );
                material
            }
            None => {
                let keypair = generate_ed25519_keypair()?;
                let now = clock.now();
                let root = create_root_certificate(
                    &keypair,
                    subject,
                    SerialId::from(config.root_ca_serial),
                    now,
                    valid_until(now, config.max_certificate_duration())?,
                )?;
                let chain = CertificateChain::single(root);
                persist_material(&paths, &keypair, &chain)?;
                info!(
                    component = %component,
                    serial = %chain.leaf().serial_id(),
                    "created self-signed root CA"
                );
                (keypair, chain)
            }
        };

        Self::assemble(component, keypair, ca_chain, config, paths, profile, clock)
    }

    /// Bring up a subordinate authority whose certificate is issued by `parent`.
    pub fn bootstrap_subordinate(
        config: &SecurityConfig,
        component: &str,
        subject: &str,
        parent: &CertificateAuthority,
    ) -> Result<Self> {
        let paths = CaPaths::new(config, component);
        let (keypair, ca_chain) = match load_material(&paths)? {
            Some(material) => material,
            None => {
                let keypair = generate_ed25519_keypair()?;
                let csr = build_csr(&keypair, subject, CertRole::Subordinate, &[])?;
                // Leave a minute of slack so the child never outlives the parent.
                let remaining = parent
                    .certificate()
                    .not_after()
                    .duration_since(parent.clock.now())
                    .unwrap_or_default()
                    .saturating_sub(Duration::from_secs(60));
                let validity = remaining.min(config.max_certificate_duration());
                let chain = parent.issue_chain(&csr, validity, CertRole::Subordinate)?;
                persist_material(&paths, &keypair, &chain)?;
                info!(
                    component = %component,
                    serial = %chain.leaf().serial_id(),
                    parent = %parent.component,
                    "created subordinate CA"
                );
                (keypair, chain)
            }
        };

        Self::assemble(
            component.to_string(),
            keypair,
            ca_chain,
            config,
            paths,
            parent.profile.clone(),
            parent.clock.clone(),
        )
    }

    fn assemble(
        component: String,
        keypair: Keypair,
        ca_chain: CertificateChain,
        config: &SecurityConfig,
        paths: CaPaths,
        profile: Arc<dyn PkiProfile>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ca_cert = ca_chain.leaf();
        if ca_cert.public_key()? != keypair.public {
            return Err(PkiError::Initialization(
                "CA certificate does not match the CA private key".to_string(),
            ));
        }
        if !ca_cert.is_ca() && !ca_cert.is_self_signed() {
            return Err(PkiError::Initialization(format!(
                "certificate {} is not a CA certificate",
                ca_cert.serial_id()
            )));
        }
        ca_chain
            .validate_links()
            .map_err(|e| PkiError::Initialization(format!("invalid CA chain: {}", e)))?;

        let root = ca_chain
            .certificates()
            .last()
            .cloned()
            .ok_or_else(|| PkiError::Initialization("empty CA chain".to_string()))?;
        verify_self_signed(&root)?;
        if paths.trust.latest_root()?.as_ref() != Some(&root) {
            paths
                .trust
                .store(&codec::encode_certificate(&root)?, CertRole::Root)?;
        }

        let persisted = load_state(&paths.state_path())?;
        let issued = paths
            .issued
            .load_all()?
            .into_iter()
            .map(|(role, chain)| {
                let cert = chain.leaf().clone();
                (cert.serial_id(), (role, cert))
            })
            .collect::<BTreeMap<_, _>>();
        let floor = ca_chain
            .iter()
            .map(|c| c.serial_id())
            .chain(issued.keys().cloned())
            .max()
            .unwrap_or_else(|| SerialId::from(0u64));
        let (last_serial, crl) = match persisted {
            Some(state) => (state.last_serial.max(floor), state.crl),
            None => (floor, RevocationList::new()),
        };

        Ok(Self {
            component,
            keypair,
            ca_chain,
            root,
            max_duration: config.max_certificate_duration(),
            paths,
            profile,
            clock,
            state: RwLock::new(CaState {
                last_serial,
                issued,
                crl,
            }),
        })
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// This authority's own certificate.
    pub fn certificate(&self) -> &Certificate {
        self.ca_chain.leaf()
    }

    /// The CA certificate followed by its issuers up to the root.
    pub fn ca_chain(&self) -> &CertificateChain {
        &self.ca_chain
    }

    pub fn root_certificate(&self) -> &Certificate {
        &self.root
    }

    pub fn is_root(&self) -> bool {
        self.ca_chain.len() == 1
    }

    /// Every root this authority has trusted, ascending by serial.
    pub fn all_root_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.paths.trust.load()?.roots().cloned().collect())
    }

    /// Sign `csr_pem` as a certificate of `role` valid for `validity` from now.
    pub fn issue(&self, csr_pem: &str, validity: Duration, role: CertRole) -> Result<Certificate> {
        let csr = parse_csr(csr_pem)?;
        self.profile.validate(&csr, role)?;

        if validity > self.max_duration {
            return Err(PkiError::PolicyViolation(format!(
                "requested validity of {}s exceeds the maximum of {}s",
                validity.as_secs(),
                self.max_duration.as_secs()
            )));
        }
        let now = self.clock.now();
        let not_after = valid_until(now, validity)?;
        if not_after > self.certificate().not_after() {
            return Err(PkiError::PolicyViolation(
                "requested validity outlives the issuing CA certificate".to_string(),
            ));
        }

        let extensions = self.profile.extensions_for(&csr, role)?;
        let mut state = self.write_state();
        let serial = state.last_serial.next();
        let params = CertificateParams {
            serial: serial.clone(),
            subject: csr.subject.clone(),
            not_before: now,
            not_after,
            extensions,
        };
        let certificate = sign_certificate(
            &params,
            &csr.public_key,
            Some(self.certificate()),
            &self.keypair.secret,
        )?;

        self.paths
            .issued
            .write_chain(&role.file_name(&serial), &CertificateChain::single(certificate.clone()))?;
        state.last_serial = serial.clone();
        save_state(&self.paths.state_path(), &state)?;
        state.issued.insert(serial.clone(), (role, certificate.clone()));

        info!(
            component = %self.component,
            serial = %serial,
            role = %role,
            subject = %certificate.subject_name(),
            "issued certificate"
        );
        Ok(certificate)
    }

    /// Issue and return the new certificate followed by this CA's chain.
    pub fn issue_chain(
        &self,
        csr_pem: &str,
        validity: Duration,
        role: CertRole,
    ) -> Result<CertificateChain> {
        let certificate = self.issue(csr_pem, validity, role)?;
        Ok(self.ca_chain.prepend(certificate))
    }

    /// Revoke an issued certificate.
    pub fn revoke(&self, serial: &SerialId, reason: RevocationReason) -> Result<RevokedEntry> {
        let mut state = self.write_state();
        if !state.issued.contains_key(serial) {
            return Err(PkiError::NotFound(format!(
                "certificate {} was not issued by {}",
                serial, self.component
            )));
        }
        let entry = state.crl.revoke(serial.clone(), reason, self.clock.now());
        save_state(&self.paths.state_path(), &state)?;
        warn!(component = %self.component, serial = %serial, reason = %reason, "revoked certificate");
        Ok(entry)
    }

    /// Snapshot of the revocation list.
    pub fn crl(&self) -> RevocationList {
        self.read_state().crl.clone()
    }

    pub fn is_revoked(&self, serial: &SerialId) -> bool {
        self.read_state().crl.contains(serial)
    }

    /// An issued certificate by serial.
    pub fn certificate_by_serial(&self, serial: &SerialId) -> Option<Certificate> {
        if let Some(ca_cert) = self.ca_chain.iter().find(|c| &c.serial_id() == serial) {
            return Some(ca_cert.clone());
        }
        self.read_state()
            .issued
            .get(serial)
            .map(|(_, cert)| cert.clone())
    }

    /// Issued certificates of `role` with serial greater than `start`,
    /// ascending, at most `count` of them.
    pub fn list_by_role(
        &self,
        role: CertRole,
        start: Option<&SerialId>,
        count: usize,
    ) -> Vec<Certificate> {
        let state = self.read_state();
        state
            .issued
            .iter()
            .filter(|(serial, _)| start.map_or(true, |s| *serial > s))
            .filter(|(_, (r, _))| *r == role)
            .take(count)
            .map(|(_, (_, cert))| cert.clone())
            .collect()
    }

    /// Drop expired certificates from the issued set and return them.
    pub fn remove_expired(&self) -> Result<Vec<Certificate>> {
        let now = self.clock.now();
        let mut state = self.write_state();
        let expired: Vec<SerialId> = state
            .issued
            .iter()
            .filter(|(_, (_, cert))| cert.not_after() < now)
            .map(|(serial, _)| serial.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for serial in expired {
            if let Some((role, cert)) = state.issued.remove(&serial) {
                self.paths.issued.remove(&role.file_name(&serial))?;
                removed.push(cert);
            }
        }
        if !removed.is_empty() {
            info!(component = %self.component, count = removed.len(), "removed expired certificates");
        }
        Ok(removed)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CaState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CaState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_material(paths: &CaPaths) -> Result<Option<(Keypair, CertificateChain)>> {
    let secret = paths.keys.read_private_key()?;
    let chain = match fs::read_to_string(paths.chain_path()) {
        Ok(pem) => Some(codec::decode(&pem)?),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    match (secret, chain) {
        (Some(secret), Some(chain)) => Ok(Some((Keypair::from_secret(secret), chain))),
        (None, None) => Ok(None),
        _ => Err(PkiError::Initialization(format!(
            "incomplete CA material in {}",
            paths.home.display()
        ))),
    }
}

fn persist_material(paths: &CaPaths, keypair: &Keypair, chain: &CertificateChain) -> Result<()> {
    paths.keys.write_keypair(keypair)?;
    write_restricted(&paths.chain_path(), &codec::encode(chain)?)
}

/// Read the configured external root certificate and key, checking that all
/// the pieces belong together.
fn import_external(config: &SecurityConfig) -> Result<(Keypair, CertificateChain)> {
    let (Some(cert_path), Some(key_path)) = (
        config.external_root_ca_cert.as_ref(),
        config.external_root_ca_private_key.as_ref(),
    ) else {
        return Err(PkiError::Config(
            "external root CA certificate and private key are required".to_string(),
        ));
    };

    let chain = codec::decode(&read_required(cert_path)?)?;
    let secret = crate::crypto::ed25519::private_key_from_pem(&read_required(key_path)?)?;
    let public = match config.external_root_ca_public_key.as_ref() {
        Some(path) => crate::crypto::ed25519::public_key_from_pem(&read_required(path)?)?,
        None => chain.leaf().public_key()?,
    };

    let keypair = Keypair::from_parts(secret, public)?;
    if chain.leaf().public_key()? != keypair.public {
        return Err(PkiError::KeypairMismatch(
            "external CA certificate was not issued for the configured key".to_string(),
        ));
    }
    Ok((keypair, chain))
}

fn read_required(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PkiError::NotFound(format!("{}", path.display())),
        _ => PkiError::Io(e),
    })
}

/// End of a validity period starting at `from`.
fn valid_until(from: SystemTime, validity: Duration) -> Result<SystemTime> {
    from.checked_add(validity).ok_or_else(|| {
        PkiError::Config(format!(
            "validity of {}s is beyond the representable time range",
            validity.as_secs()
        ))
    })
}

fn verify_self_signed(root: &Certificate) -> Result<()> {
    if root.tbs_certificate.subject != root.tbs_certificate.issuer {
        return Err(PkiError::Initialization(format!(
            "root certificate {} is not self-issued",
            root.serial_id()
        )));
    }
    let key = root.public_key()?;
    root.verify_signed_by(&key).map_err(|e| {
        PkiError::Initialization(format!("root certificate self-signature check failed: {}", e))
    })
}

fn load_state(path: &Path) -> Result<Option<PersistedState>> {
    match fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_state(path: &Path, state: &CaState) -> Result<()> {
    let persisted = PersistedState {
        last_serial: state.last_serial.clone(),
        crl: state.crl.clone(),
    };
    write_restricted(path, &serde_json::to_string_pretty(&persisted)?)
}
