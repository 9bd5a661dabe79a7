//! Per-node certificate client.
//!
//! A [`CertificateClient`] owns one component's identity: its key pair, its
//! certificate chain and the set of CA certificates it trusts. It brings the
//! identity up at startup ([`CertificateClient::init`] and
//! [`CertificateClient::ensure_initialized`]), signs and verifies on behalf of
//! the component, and renews the certificate before it expires without ever
//! leaving the node without a usable identity.
//!
//! The identity and the trust store are immutable snapshots published through
//! [`ArcSwap`], so readers never block and always see a consistent pair of
//! key and certificate.

pub mod init;
pub mod notification;
pub mod renewal;
pub mod root_poller;

pub use init::InitState;
pub use notification::{CertificateNotification, HealthReporter};
pub use root_poller::{RootCaRotationPoller, RootCaSource, ServiceRootCaSource};

use crate::ca::RevocationList;
use crate::cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
use crate::cert::codec;
use crate::clock::Clock;
use crate::config::{IdentityLayout, SecurityConfig};
use crate::crypto::ed25519::{verify_signature, Keypair};
use crate::error::{PkiError, Result};
use crate::net::service::{CertificateService, NodeDescriptor};
use crate::storage::cert_storage::CertificateStorage;
use crate::storage::keystore::KeyFiles;
use crate::storage::trusted::{TrustStore, TrustedCertStorage};
use arc_swap::ArcSwap;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use x509_cert::certificate::Certificate;
use x509_cert::ext::pkix::name::GeneralName;

/// What a component needs to request and hold its identity.
#[derive(Debug, Clone)]
pub struct ClientCapabilities {
    /// Component name, also used as the directory name under the metadata dir.
    pub component_name: String,
    /// Subject requested in every CSR, e.g. `CN=datanode-1`.
    pub subject: String,
    /// Alternative names requested in every CSR.
    pub alt_names: Vec<GeneralName>,
    /// Identity presented to the CA service.
    pub descriptor: NodeDescriptor,
}

impl ClientCapabilities {
    pub fn new(component_name: &str, subject: &str, descriptor: NodeDescriptor) -> Self {
        Self {
            component_name: component_name.to_string(),
            subject: subject.to_string(),
            alt_names: Vec::new(),
            descriptor,
        }
    }
}

/// In-memory view of a component's identity.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    pub private_key: Option<SigningKey>,
    pub public_key: Option<VerifyingKey>,
    pub chain: Option<CertificateChain>,
}

impl IdentitySnapshot {
    pub fn certificate(&self) -> Option<&Certificate> {
        self.chain.as_ref().map(|c| c.leaf())
    }

    pub fn serial_id(&self) -> Option<SerialId> {
        self.certificate().map(|c| c.serial_id())
    }

    /// Both key halves, if present and consistent.
    pub fn keypair(&self) -> Option<Keypair> {
        match (&self.private_key, &self.public_key) {
            (Some(secret), Some(public)) => Keypair::from_parts(secret.clone(), *public).ok(),
            _ => None,
        }
    }
}

/// Shared read handle on a client's identity, for consumers such as the TLS
/// key manager that must observe renewals.
#[derive(Debug, Clone)]
pub struct IdentityHandle {
    component_name: String,
    identity: Arc<ArcSwap<IdentitySnapshot>>,
}

impl IdentityHandle {
    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn load(&self) -> Arc<IdentitySnapshot> {
        self.identity.load_full()
    }
}

pub(crate) struct ClientInner {
    pub(crate) config: SecurityConfig,
    pub(crate) caps: ClientCapabilities,
    pub(crate) layout: IdentityLayout,
    pub(crate) service: Arc<dyn CertificateService>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) identity: Arc<ArcSwap<IdentitySnapshot>>,
    pub(crate) trust: ArcSwap<TrustStore>,
    pub(crate) trusted_storage: TrustedCertStorage,
    pub(crate) listeners: RwLock<Vec<Arc<dyn CertificateNotification>>>,
    pub(crate) health: RwLock<Option<Arc<dyn HealthReporter>>>,
    pub(crate) renewal_lock: tokio::sync::Mutex<()>,
    pub(crate) renewal_task: Mutex<Option<renewal::RenewalTask>>,
    pub(crate) closed: AtomicBool,
    pub(crate) close_signal: tokio::sync::Notify,
    pub(crate) init_outcome: Mutex<init::InitOutcome>,
    pub(crate) local_crl_id: AtomicU64,
}

/// Certificate client of one component. Cloning yields another handle on
/// the same client.
#[derive(Clone)]
pub struct CertificateClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for CertificateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateClient")
            .field("component", &self.inner.caps.component_name)
            .field("serial", &self.cert_serial_id())
            .finish_non_exhaustive()
    }
}

impl CertificateClient {
    /// Create a client using the default directory layout for the component.
    ///
    /// Key files, certificate and trust directory found on disk are loaded
    /// into memory; nothing is generated until [`CertificateClient::init`].
    pub fn new(
        config: SecurityConfig,
        caps: ClientCapabilities,
        service: Arc<dyn CertificateService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let layout = IdentityLayout::for_component(&config, &caps.component_name);
        Self::with_layout(config, caps, layout, service, clock)
    }

    pub fn with_layout(
        config: SecurityConfig,
        caps: ClientCapabilities,
        layout: IdentityLayout,
        service: Arc<dyn CertificateService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let trusted_storage = TrustedCertStorage::new(&layout.trust_dir);
        let trust = trusted_storage.load()?;
        let snapshot = load_snapshot(&layout, &layout.identity_dir);

        info!(
            component = %caps.component_name,
            serial = ?snapshot.serial_id(),
            trusted = trust.len(),
            "certificate client created"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                caps,
                layout,
                service,
                clock,
                identity: Arc::new(ArcSwap::from_pointee(snapshot)),
                trust: ArcSwap::from_pointee(trust),
                trusted_storage,
                listeners: RwLock::new(Vec::new()),
                health: RwLock::new(None),
                renewal_lock: tokio::sync::Mutex::new(()),
                renewal_task: Mutex::new(None),
                closed: AtomicBool::new(false),
                close_signal: tokio::sync::Notify::new(),
                init_outcome: Mutex::new(init::InitOutcome::default()),
                local_crl_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn component_name(&self) -> &str {
        &self.inner.caps.component_name
    }

    pub fn layout(&self) -> &IdentityLayout {
        &self.inner.layout
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> Arc<IdentitySnapshot> {
        self.inner.identity.load_full()
    }

    pub fn identity_handle(&self) -> IdentityHandle {
        IdentityHandle {
            component_name: self.inner.caps.component_name.clone(),
            identity: self.inner.identity.clone(),
        }
    }

    pub fn trust_store(&self) -> Arc<TrustStore> {
        self.inner.trust.load_full()
    }

    /// The component's current leaf certificate.
    pub fn certificate(&self) -> Option<Certificate> {
        self.identity().certificate().cloned()
    }

    pub fn certificate_chain(&self) -> Option<CertificateChain> {
        self.identity().chain.clone()
    }

    pub fn cert_serial_id(&self) -> Option<SerialId> {
        self.identity().serial_id()
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        self.identity().public_key
    }

    /// The certificate that issued this component's certificate.
    pub fn ca_certificate(&self) -> Option<Certificate> {
        let identity = self.identity();
        let chain = identity.chain.as_ref()?;
        chain
            .certificates()
            .get(1)
            .cloned()
            .or_else(|| self.trust_store().find_issuer(chain.leaf()).cloned())
    }

    /// The trusted root with the greatest serial.
    pub fn root_ca_certificate(&self) -> Option<Certificate> {
        self.trust_store().latest_root().cloned()
    }

    /// A certificate by serial: this component's own chain first, then the
    /// trust store.
    pub fn certificate_by_serial(&self, serial: &SerialId) -> Option<Certificate> {
        let identity = self.identity();
        if let Some(cert) = identity
            .chain
            .as_ref()
            .and_then(|chain| chain.iter().find(|c| &c.serial_id() == serial))
        {
            return Some(cert.clone());
        }
        self.trust_store().get(serial).cloned()
    }

    /// Sign `data` with the component's private key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let identity = self.identity();
        let secret = identity.private_key.as_ref().ok_or_else(|| {
            PkiError::Signing(format!(
                "no private key available for {}",
                self.component_name()
            ))
        })?;
        Ok(secret.sign(data).to_bytes().to_vec())
    }

    /// Check `signature` over `data` with the key of `cert`. Never fails;
    /// malformed input simply does not verify.
    pub fn verify(&self, data: &[u8], signature: &[u8], cert: &Certificate) -> bool {
        match cert.public_key() {
            Ok(key) => verify_signature(&key, data, signature),
            Err(e) => {
                debug!(error = %e, "cannot verify with certificate key");
                false
            }
        }
    }

    /// Whether `cert` chains to a trusted root, is not revoked and is
    /// currently valid.
    pub fn verify_certificate(&self, cert: &Certificate) -> bool {
        match self.trust_store().verify(cert, self.inner.clock.now()) {
            Ok(()) => true,
            Err(e) => {
                debug!(serial = %cert.serial_id(), error = %e, "certificate rejected");
                false
            }
        }
    }

    /// Persist `pem` in the trust directory under its role and add it to the
    /// trust store.
    pub fn store_certificate(&self, pem: &str, role: CertRole) -> Result<CertificateChain> {
        let chain = self.inner.trusted_storage.store(pem, role)?;
        let leaf = chain.leaf().clone();
        self.inner
            .trust
            .rcu(|store| store.with_certificate(role, leaf.clone()));
        debug!(component = %self.component_name(), serial = %leaf.serial_id(), role = %role, "stored certificate");
        Ok(chain)
    }

    /// Store a root CA certificate.
    pub fn store_root_ca_certificate(&self, pem: &str) -> Result<CertificateChain> {
        self.store_certificate(pem, CertRole::Root)
    }

    /// Fetch a certificate from the CA service and store it.
    pub async fn fetch_certificate(&self, serial: &SerialId) -> Result<Certificate> {
        if let Some(cert) = self.certificate_by_serial(serial) {
            return Ok(cert);
        }
        let pem = self.inner.service.get_certificate(serial).await?;
        let cert = codec::decode_certificate(&pem)?;
        if &cert.serial_id() != serial {
            return Err(PkiError::Certificate(format!(
                "service returned certificate {} for serial {}",
                cert.serial_id(),
                serial
            )));
        }
        self.store_certificate(&pem, cert.role())?;
        Ok(cert)
    }

    /// Fetch every CA certificate from the service and trust it.
    pub async fn update_ca_list(&self) -> Result<Vec<Certificate>> {
        let pems = self.inner.service.list_ca_certificates().await?;
        let mut certificates = Vec::with_capacity(pems.len());
        for pem in pems {
            let chain = self.store_certificate(&pem, CertRole::Subordinate)?;
            certificates.push(chain.leaf().clone());
        }
        info!(component = %self.component_name(), count = certificates.len(), "updated CA list");
        Ok(certificates)
    }

    /// Apply a revocation list. Returns `true` when this component's own
    /// certificate is among the revoked serials.
    pub fn process_crl(&self, crl: &RevocationList) -> Result<bool> {
        let storage = self.inner.trusted_storage.storage();
        for serial in crl.serials() {
            for role in [CertRole::Root, CertRole::Subordinate, CertRole::Leaf] {
                storage.remove(&role.file_name(serial))?;
            }
        }
        self.inner.trust.rcu(|store| store.with_revoked(crl.serials()));
        self.inner
            .local_crl_id
            .fetch_max(crl.crl_number, Ordering::SeqCst);

        let own_revoked = self
            .cert_serial_id()
            .map_or(false, |serial| crl.contains(&serial));
        if own_revoked {
            warn!(component = %self.component_name(), "own certificate has been revoked");
        }
        Ok(own_revoked)
    }

    /// Fetch the latest revocation list from the service and apply it.
    pub async fn fetch_and_process_crl(&self) -> Result<bool> {
        let crl = self.inner.service.latest_crl().await?;
        self.process_crl(&crl)
    }

    /// Highest CRL number applied so far.
    pub fn local_crl_id(&self) -> u64 {
        self.inner.local_crl_id.load(Ordering::SeqCst)
    }

    /// Add a listener called after every successful renewal.
    pub fn register_notification_receiver(&self, listener: Arc<dyn CertificateNotification>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Set the reporter told about repeated renewal failures.
    pub fn set_health_reporter(&self, reporter: Arc<dyn HealthReporter>) {
        *self.inner.health.write().unwrap_or_else(|e| e.into_inner()) = Some(reporter);
    }

    /// A consumer for [`RootCaRotationPoller`] that trusts every root it has
    /// not seen yet.
    pub fn root_ca_consumer(&self) -> impl Fn(&[Certificate]) + Send + Sync + 'static {
        let client = self.clone();
        move |roots: &[Certificate]| {
            for root in roots {
                if client.trust_store().contains(&root.serial_id()) {
                    continue;
                }
                let stored = codec::encode_certificate(root)
                    .and_then(|pem| client.store_root_ca_certificate(&pem));
                match stored {
                    Ok(_) => info!(
                        component = %client.component_name(),
                        serial = %root.serial_id(),
                        "trusting new root CA certificate"
                    ),
                    Err(e) => warn!(
                        component = %client.component_name(),
                        serial = %root.serial_id(),
                        error = %e,
                        "failed to store root CA certificate"
                    ),
                }
            }
        }
    }

    /// Remove the backup generation left by the last renewal.
    pub fn clean_backup_dir(&self) -> Result<()> {
        remove_dir_if_exists(&self.inner.layout.backup_dir)
    }

    /// Timeout used to bound waiting on background work during close.
    pub(crate) fn shutdown_timeout(&self) -> Duration {
        self.inner.config.shutdown_timeout()
    }

    pub(crate) fn publish_identity(&self, snapshot: IdentitySnapshot) {
        self.inner.identity.store(Arc::new(snapshot));
    }

    /// Trust the issuers carried by a freshly received chain and root.
    pub(crate) fn trust_received_chain(
        &self,
        chain: &CertificateChain,
        root_pem: Option<&str>,
    ) -> Result<()> {
        for cert in chain.iter().skip(1) {
            let role = cert.role();
            if !self.trust_store().contains(&cert.serial_id()) {
                self.store_certificate(&codec::encode_certificate(cert)?, role)?;
            }
        }
        if let Some(root_pem) = root_pem {
            for root in codec::decode(root_pem)?.iter() {
                if !self.trust_store().contains(&root.serial_id()) {
                    self.store_root_ca_certificate(&codec::encode_certificate(root)?)?;
                }
            }
        }
        Ok(())
    }
}

/// Read whatever identity material exists in `dir`; unreadable files are
/// logged and treated as absent.
pub(crate) fn load_snapshot(layout: &IdentityLayout, dir: &Path) -> IdentitySnapshot {
    let keys = KeyFiles::in_dir(layout, dir);
    let private_key = keys.read_private_key().unwrap_or_else(|e| {
        warn!(dir = %dir.display(), error = %e, "unreadable private key");
        None
    });
    let public_key = keys.read_public_key().unwrap_or_else(|e| {
        warn!(dir = %dir.display(), error = %e, "unreadable public key");
        None
    });
    let chain = read_chain(dir, &layout.certificate_file_name).unwrap_or_else(|e| {
        warn!(dir = %dir.display(), error = %e, "unreadable certificate");
        None
    });
    IdentitySnapshot {
        private_key,
        public_key,
        chain,
    }
}

pub(crate) fn read_chain(dir: &Path, file_name: &str) -> Result<Option<CertificateChain>> {
    match CertificateStorage::new(dir).read_chain(file_name) {
        Ok(chain) => Ok(Some(chain)),
        Err(PkiError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;
    use crate::ca::RevocationReason;

    #[tokio::test]
    async fn test_sign_without_key_fails() {
        let fixture = Fixture::new();
        let client = fixture.client("om");

        match client.sign(b"payload") {
            Err(e @ PkiError::Signing(_)) => assert!(e.to_string().contains("Error while signing")),
            _ => panic!("Expected Signing error"),
        }
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let fixture = Fixture::new();
        let client = fixture.client("om");
        client.ensure_initialized().await.unwrap();

        let cert = client.certificate().unwrap();
        let signature = client.sign(b"payload").unwrap();
        assert!(client.verify(b"payload", &signature, &cert));
        assert!(!client.verify(b"tampered", &signature, &cert));
        assert!(!client.verify(b"payload", b"garbage", &cert));
    }

    #[tokio::test]
    async fn test_verify_certificate_uses_trust_store() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();

        let cert = client.certificate().unwrap();
        assert!(client.verify_certificate(&cert));
        assert!(client.root_ca_certificate().unwrap().is_self_signed());
        assert_eq!(
            client.ca_certificate().unwrap(),
            *fixture.service.authority().certificate()
        );

        // Outside the validity window
        fixture.clock.advance(Duration::from_secs(2 * 86400));
        assert!(!client.verify_certificate(&cert));
    }

    #[tokio::test]
    async fn test_crl_processing() {
        let fixture = Fixture::new();
        let a = fixture.client("a");
        let b = fixture.client("b");
        a.ensure_initialized().await.unwrap();
        b.ensure_initialized().await.unwrap();

        let b_cert = b.certificate().unwrap();
        fixture
            .service
            .authority()
            .revoke(&b_cert.serial_id(), RevocationReason::KeyCompromise)
            .unwrap();

        assert!(!a.fetch_and_process_crl().await.unwrap());
        assert!(!a.verify_certificate(&b_cert));
        assert_eq!(a.local_crl_id(), 1);

        assert!(b.fetch_and_process_crl().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_certificate_by_serial() {
        let fixture = Fixture::new();
        let a = fixture.client("a");
        let b = fixture.client("b");
        a.ensure_initialized().await.unwrap();
        b.ensure_initialized().await.unwrap();

        let serial = b.cert_serial_id().unwrap();
        assert!(a.certificate_by_serial(&serial).is_none());

        let fetched = a.fetch_certificate(&serial).await.unwrap();
        assert_eq!(fetched, b.certificate().unwrap());
        assert!(a.certificate_by_serial(&serial).is_some());
        assert!(a
            .layout()
            .trust_dir
            .join(format!("{}.crt", serial))
            .exists());
    }

    #[tokio::test]
    async fn test_root_ca_consumer_stores_new_roots() {
        let fixture = Fixture::new();
        let client = fixture.client("scm");

        let keypair = crate::crypto::ed25519::generate_ed25519_keypair().unwrap();
        let new_root = crate::cert::x509_signing::create_self_signed_ca(
            &keypair,
            "CN=Next Root",
            fixture.clock.now(),
            365,
        )
        .unwrap();

        let consumer = client.root_ca_consumer();
        consumer(&[new_root.clone()]);
        consumer(&[new_root.clone()]);

        assert!(client.trust_store().contains(&new_root.serial_id()));
        assert_eq!(client.trust_store().roots().count(), 1);
    }
}
