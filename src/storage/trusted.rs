//! Trusted CA certificates.
//!
//! [`TrustStore`] is an immutable snapshot of the certificates a node trusts,
//! indexed by serial. Updates build a new snapshot which callers publish
//! atomically, so concurrent readers always see a consistent set.
//! [`TrustedCertStorage`] is its on-disk counterpart.

use crate::cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
use crate::error::{PkiError, Result};
use crate::storage::cert_storage::CertificateStorage;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::SystemTime;
use x509_cert::certificate::Certificate;

/// Longest issuer path walked while verifying a certificate.
const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Debug, Clone)]
struct TrustedEntry {
    role: CertRole,
    certificate: Certificate,
}

/// Immutable set of trusted certificates plus revoked serials.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    entries: BTreeMap<SerialId, TrustedEntry>,
    revoked: BTreeSet<SerialId>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_certificates<I>(certificates: I) -> Self
    where
        I: IntoIterator<Item = (CertRole, Certificate)>,
    {
        let entries = certificates
            .into_iter()
            .map(|(role, certificate)| (certificate.serial_id(), TrustedEntry { role, certificate }))
            .collect();
        Self {
            entries,
            revoked: BTreeSet::new(),
        }
    }

    /// A copy of this store that also trusts `certificate`.
    pub fn with_certificate(&self, role: CertRole, certificate: Certificate) -> Self {
        let mut next = self.clone();
        next.entries
            .insert(certificate.serial_id(), TrustedEntry { role, certificate });
        next
    }

    /// A copy of this store with `serials` revoked and dropped.
    pub fn with_revoked<'a, I>(&self, serials: I) -> Self
    where
        I: IntoIterator<Item = &'a SerialId>,
    {
        let mut next = self.clone();
        for serial in serials {
            next.entries.remove(serial);
            next.revoked.insert(serial.clone());
        }
        next
    }

    pub fn get(&self, serial: &SerialId) -> Option<&Certificate> {
        self.entries.get(serial).map(|e| &e.certificate)
    }

    pub fn contains(&self, serial: &SerialId) -> bool {
        self.entries.contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_revoked(&self, serial: &SerialId) -> bool {
        self.revoked.contains(serial)
    }

    pub fn revoked(&self) -> impl Iterator<Item = &SerialId> {
        self.revoked.iter()
    }

    /// Certificates of `role` in ascending serial order.
    pub fn by_role(&self, role: CertRole) -> impl Iterator<Item = &Certificate> {
        self.entries
            .values()
            .filter(move |e| e.role == role)
            .map(|e| &e.certificate)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Certificate> {
        self.by_role(CertRole::Root)
    }

    pub fn subordinates(&self) -> impl Iterator<Item = &Certificate> {
        self.by_role(CertRole::Subordinate)
    }

    /// The trusted root with the greatest serial.
    pub fn latest_root(&self) -> Option<&Certificate> {
        self.roots().last()
    }

    /// Verify `certificate` chains to a trusted root at `now`.
    ///
    /// Every certificate on the path must be inside its validity window and
    /// not revoked.
    pub fn verify(&self, certificate: &Certificate, now: SystemTime) -> Result<()> {
        let mut current = certificate.clone();
        for _ in 0..MAX_CHAIN_DEPTH {
            let serial = current.serial_id();
            if self.is_revoked(&serial) {
                return Err(PkiError::Certificate(format!("certificate {} is revoked", serial)));
            }
            if !current.is_valid_at(now) {
                return Err(PkiError::Certificate(format!(
                    "certificate {} is outside its validity period",
                    serial
                )));
            }
            if self
                .entries
                .get(&serial)
                .is_some_and(|e| e.role == CertRole::Root && e.certificate == current)
            {
                return Ok(());
            }
            current = self
                .find_issuer(&current)
                .cloned()
                .ok_or_else(|| {
                    PkiError::Certificate(format!(
                        "no trusted issuer for certificate {} ({})",
                        serial,
                        current.issuer_name()
                    ))
                })?;
        }
        Err(PkiError::Certificate("certificate chain too long".to_string()))
    }

    /// A trusted CA whose subject matches the issuer of `certificate` and whose
    /// key verifies its signature.
    pub fn find_issuer(&self, certificate: &Certificate) -> Option<&Certificate> {
        self.entries
            .values()
            .filter(|e| e.role != CertRole::Leaf)
            .map(|e| &e.certificate)
            .filter(|ca| ca.tbs_certificate.subject == certificate.tbs_certificate.issuer)
            .find(|ca| {
                ca.public_key()
                    .and_then(|key| certificate.verify_signed_by(&key))
                    .is_ok()
            })
    }
}

/// The trust directory of a component.
#[derive(Debug, Clone)]
pub struct TrustedCertStorage {
    storage: CertificateStorage,
}

impl TrustedCertStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: CertificateStorage::new(dir),
        }
    }

    pub fn storage(&self) -> &CertificateStorage {
        &self.storage
    }

    /// Persist `pem` under its role-prefixed name.
    pub fn store(&self, pem: &str, role: CertRole) -> Result<CertificateChain> {
        self.storage.write_with_role(pem, role)
    }

    /// Persist the default root certificate handed out at bootstrap.
    pub fn store_default_certificate(&self, pem: &str) -> Result<CertificateChain> {
        self.store(pem, CertRole::Root)
    }

    /// Read every trusted certificate into a fresh snapshot.
    pub fn load(&self) -> Result<TrustStore> {
        let certificates = self
            .storage
            .load_all()?
            .into_iter()
            .map(|(role, chain)| (role, chain.leaf().clone()));
        Ok(TrustStore::from_certificates(certificates))
    }

    /// The stored self-signed certificate with the greatest serial.
    pub fn latest_root(&self) -> Result<Option<Certificate>> {
        Ok(self
            .storage
            .load_all()?
            .into_iter()
            .filter(|(role, _)| *role == CertRole::Root)
            .map(|(_, chain)| chain.leaf().clone())
            .max_by_key(|cert| cert.serial_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::codec;
    use crate::cert::x509_signing::{create_root_certificate, issue_certificate};
    use crate::crypto::ed25519::{generate_ed25519_keypair, Keypair};
    use std::time::Duration;
    use tempfile::TempDir;

    fn root(serial: u64) -> (Keypair, Certificate) {
        let keypair = generate_ed25519_keypair().unwrap();
        let now = SystemTime::now();
        let cert = create_root_certificate(
            &keypair,
            "CN=Root",
            SerialId::from(serial),
            now - Duration::from_secs(60),
            now + Duration::from_secs(86400),
        )
        .unwrap();
        (keypair, cert)
    }

    #[test]
    fn test_latest_root_by_serial() {
        let temp_dir = TempDir::new().unwrap();
        let trusted = TrustedCertStorage::new(temp_dir.path());
        assert!(trusted.latest_root().unwrap().is_none());

        for serial in [5u64, 1000, 200] {
            let (_, cert) = root(serial);
            trusted
                .store(&codec::encode_certificate(&cert).unwrap(), CertRole::Root)
                .unwrap();
        }

        let latest = trusted.latest_root().unwrap().unwrap();
        assert_eq!(latest.serial_id(), SerialId::from(1000u64));
        assert_eq!(
            trusted.load().unwrap().latest_root().unwrap().serial_id(),
            SerialId::from(1000u64)
        );
    }

    #[test]
    fn test_store_default_certificate() {
        let temp_dir = TempDir::new().unwrap();
        let trusted = TrustedCertStorage::new(temp_dir.path());
        let (_, cert) = root(7);

        trusted
            .store_default_certificate(&codec::encode_certificate(&cert).unwrap())
            .unwrap();
        assert!(temp_dir.path().join("ROOTCA-7.crt").is_file());
        assert_eq!(trusted.latest_root().unwrap(), Some(cert));
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let (_, cert) = root(1);
        let empty = TrustStore::new();
        let one = empty.with_certificate(CertRole::Root, cert.clone());

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);

        let revoked = one.with_revoked([&cert.serial_id()]);
        assert_eq!(one.len(), 1);
        assert!(revoked.is_empty());
        assert!(revoked.is_revoked(&cert.serial_id()));
    }

    #[test]
    fn test_verify_through_subordinate() {
        let (root_keypair, root_cert) = root(1);
        let sub_keypair = generate_ed25519_keypair().unwrap();
        let sub = issue_certificate(
            &sub_keypair.public,
            "CN=Sub CA",
            &root_keypair,
            &root_cert,
            true,
            SystemTime::now(),
            1,
        )
        .unwrap();
        let leaf_keypair = generate_ed25519_keypair().unwrap();
        let leaf = issue_certificate(
            &leaf_keypair.public,
            "CN=node",
            &sub_keypair,
            &sub,
            false,
            SystemTime::now(),
            1,
        )
        .unwrap();

        let store = TrustStore::new().with_certificate(CertRole::Root, root_cert.clone());
        assert!(store.verify(&leaf, SystemTime::now()).is_err());

        let store = store.with_certificate(CertRole::Subordinate, sub.clone());
        assert!(store.verify(&leaf, SystemTime::now()).is_ok());
        assert!(store.verify(&root_cert, SystemTime::now()).is_ok());

        // Expired at a later instant
        let later = SystemTime::now() + Duration::from_secs(3 * 86400);
        assert!(store.verify(&leaf, later).is_err());

        let store = store.with_revoked([&sub.serial_id()]);
        assert!(store.verify(&leaf, SystemTime::now()).is_err());
    }

    #[test]
    fn test_untrusted_root_fails() {
        let (_, trusted_root) = root(1);
        let (_, other_root) = root(2);
        let store = TrustStore::new().with_certificate(CertRole::Root, trusted_root);
        assert!(store.verify(&other_root, SystemTime::now()).is_err());
    }
}
