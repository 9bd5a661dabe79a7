//! Integration tests for cluster-pki.
//!
//! These tests drive complete identity lifecycles against a stub CA whose
//! serial numbers and availability are scripted by the test.

use async_trait::async_trait;
use cluster_pki::ca::{CertificateAuthority, RevocationList};
use cluster_pki::cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
use cluster_pki::cert::codec;
use cluster_pki::cert::csr::parse_csr;
use cluster_pki::cert::x509_signing::{
    create_root_certificate, leaf_extensions, sign_certificate, CertificateParams,
};
use cluster_pki::client::{
    CertificateClient, ClientCapabilities, InitState, RootCaRotationPoller, RootCaSource,
};
use cluster_pki::clock::{Clock, ManualClock};
use cluster_pki::config::SecurityConfig;
use cluster_pki::crypto::ed25519::{generate_ed25519_keypair, Keypair};
use cluster_pki::error::{PkiError, Result};
use cluster_pki::net::{
    CertificateService, NodeDescriptor, ReloadingKeyManager, SignedCertificateResponse,
};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use x509_cert::certificate::Certificate;

const DAY: Duration = Duration::from_secs(86400);
const HOUR: Duration = Duration::from_secs(3600);

/// A CA that hands out scripted serials and can be switched off.
struct StubCa {
    keypair: Keypair,
    root: Certificate,
    clock: Arc<ManualClock>,
    serials: Mutex<VecDeque<u64>>,
    failing: AtomicBool,
}

impl StubCa {
    fn new(clock: Arc<ManualClock>, serials: &[u64]) -> Self {
        let keypair = generate_ed25519_keypair().unwrap();
        let now = clock.now();
        let root =
            create_root_certificate(&keypair, "CN=Stub Root", SerialId::from(1u64), now, now + 3650 * DAY)
                .unwrap();
        Self {
            keypair,
            root,
            clock,
            serials: Mutex::new(serials.iter().copied().collect()),
            failing: AtomicBool::new(false),
        }
    }

    fn root_pem(&self) -> String {
        codec::encode_certificate(&self.root).unwrap()
    }
}

#[async_trait]
impl CertificateService for StubCa {
    async fn submit_csr(
        &self,
        _node: &NodeDescriptor,
        csr_pem: &str,
    ) -> Result<SignedCertificateResponse> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PkiError::Service("CA unavailable".to_string()));
        }
        let serial = self
            .serials
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PkiError::Service("out of serials".to_string()))?;

        let csr = parse_csr(csr_pem)?;
        let now = self.clock.now();
        let params = CertificateParams {
            serial: SerialId::from(serial),
            subject: csr.subject.clone(),
            not_before: now,
            not_after: now + DAY,
            extensions: leaf_extensions(&csr.requested.alt_names)?,
        };
        let leaf = sign_certificate(&params, &csr.public_key, Some(&self.root), &self.keypair.secret)?;
        let chain = CertificateChain::new(vec![leaf, self.root.clone()])?;

        Ok(SignedCertificateResponse {
            leaf_chain_pem: codec::encode(&chain)?,
            ca_chain_pem: self.root_pem(),
            root_chain_pem: Some(self.root_pem()),
        })
    }

    async fn get_certificate(&self, serial: &SerialId) -> Result<String> {
        Err(PkiError::NotFound(format!("certificate {}", serial)))
    }

    async fn list_certificates(
        &self,
        _role: CertRole,
        _start: Option<SerialId>,
        _count: usize,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_ca_certificates(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn all_root_ca_certificates(&self) -> Result<Vec<String>> {
        Ok(vec![self.root_pem()])
    }

    async fn latest_crl(&self) -> Result<RevocationList> {
        Ok(RevocationList::new())
    }
}

fn test_config(dir: &Path) -> SecurityConfig {
    let mut config = SecurityConfig::with_metadata_dir(dir);
    config.renewal_grace_period_secs = 18 * 3600;
    config.renewal_check_interval_secs = 1;
    config.shutdown_timeout_secs = 2;
    config
}

fn datanode(
    config: &SecurityConfig,
    service: Arc<StubCa>,
    clock: Arc<ManualClock>,
) -> CertificateClient {
    let caps = ClientCapabilities::new(
        "datanode",
        "CN=datanode-1",
        NodeDescriptor::leaf("datanode-1", "dn1.cluster.local"),
    );
    CertificateClient::new(config.clone(), caps, service, clock).unwrap()
}

fn identity_bytes(client: &CertificateClient) -> Vec<Vec<u8>> {
    let dir = &client.layout().identity_dir;
    ["private.pem", "public.pem", "certificate.crt"]
        .iter()
        .map(|name| fs::read(dir.join(name)).unwrap())
        .collect()
}

#[tokio::test]
async fn test_bootstrap_and_renewal_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let clock = Arc::new(ManualClock::starting_now());
    let ca = Arc::new(StubCa::new(clock.clone(), &[100, 200]));
    let client = datanode(&config, ca.clone(), clock.clone());

    // 1. Empty identity
    assert_eq!(client.init().unwrap(), InitState::GetCert);

    // 2. Obtain the first certificate
    client.ensure_initialized().await.unwrap();
    assert_eq!(client.cert_serial_id().unwrap(), SerialId::from(100u64));
    assert_eq!(client.init().unwrap(), InitState::Success);
    assert!(client.verify_certificate(&client.certificate().unwrap()));

    // 3. Enter the grace window and let the renewal service act
    client.start_renewal_service().unwrap();
    clock.advance(7 * HOUR);
    for _ in 0..100 {
        if client.cert_serial_id().unwrap() == SerialId::from(200u64) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(client.cert_serial_id().unwrap(), SerialId::from(200u64));

    // 4. The previous generation sits in the backup directory
    let layout = client.layout();
    let backup = codec::decode(&fs::read_to_string(layout.backup_dir.join("certificate.crt")).unwrap())
        .unwrap();
    assert_eq!(backup.leaf().serial_id(), SerialId::from(100u64));
    assert!(!layout.staging_dir.exists());

    let remaining = client.time_before_expiry_grace_period(&client.certificate().unwrap());
    assert!(remaining > Duration::ZERO);
    assert!(remaining < 18 * HOUR);

    // 5. Close stops the background task
    client.close().await;
    assert!(!client.is_renewal_service_running());
    assert_eq!(client.init().unwrap(), InitState::Success);
}

#[tokio::test]
async fn test_failed_renewal_leaves_identity_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let clock = Arc::new(ManualClock::starting_now());
    let ca = Arc::new(StubCa::new(clock.clone(), &[100, 300]));
    let client = datanode(&config, ca.clone(), clock.clone());
    client.ensure_initialized().await.unwrap();

    let before = identity_bytes(&client);
    ca.failing.store(true, Ordering::SeqCst);

    match client.renew_and_store_key_and_certificate(true).await {
        Err(PkiError::Service(_)) => {}
        _ => panic!("Expected Service error"),
    }
    assert_eq!(identity_bytes(&client), before);
    assert_eq!(client.cert_serial_id().unwrap(), SerialId::from(100u64));
    assert!(!client.layout().backup_dir.exists());

    // A later attempt succeeds with a new serial
    ca.failing.store(false, Ordering::SeqCst);
    let serial = client.renew_and_store_key_and_certificate(true).await.unwrap();
    assert_eq!(serial, SerialId::from(300u64));
    assert_ne!(identity_bytes(&client), before);
}

#[tokio::test]
async fn test_restart_reloads_identity() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let clock = Arc::new(ManualClock::starting_now());
    let ca = Arc::new(StubCa::new(clock.clone(), &[100]));

    let first = datanode(&config, ca.clone(), clock.clone());
    first.ensure_initialized().await.unwrap();
    let signature = first.sign(b"heartbeat").unwrap();
    first.close().await;

    let second = datanode(&config, ca, clock);
    assert_eq!(second.init().unwrap(), InitState::Success);
    assert_eq!(second.cert_serial_id(), first.cert_serial_id());
    assert!(second.verify(b"heartbeat", &signature, &second.certificate().unwrap()));
    assert_eq!(second.root_ca_certificate().unwrap().serial_id(), SerialId::from(1u64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_manager_reload_under_concurrency() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let clock = Arc::new(ManualClock::starting_now());
    let ca = Arc::new(StubCa::new(clock.clone(), &[100, 200]));
    let client = datanode(&config, ca, clock);
    client.ensure_initialized().await.unwrap();

    let manager = Arc::new(ReloadingKeyManager::new(client.identity_handle()).unwrap());
    client.register_notification_receiver(manager.clone());
    let old_leaf = manager.current().certificate_chain()[0].clone();
    let old_alias = manager.choose_server_alias();

    let mut lookups = Vec::new();
    for _ in 0..100 {
        let manager = manager.clone();
        let alias = old_alias.clone();
        lookups.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..20 {
                let key = manager.certified_key(&alias);
                seen.push(key.cert[0].clone());
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let new_serial = client.renew_and_store_key_and_certificate(true).await.unwrap();
    let new_leaf = manager.current().certificate_chain()[0].clone();
    assert_eq!(new_serial, SerialId::from(200u64));
    assert_ne!(old_leaf, new_leaf);

    for lookup in lookups {
        for leaf in lookup.await.unwrap() {
            assert!(leaf == old_leaf || leaf == new_leaf);
        }
    }
    assert_eq!(manager.certified_key(&old_alias).cert[0], new_leaf);
}

struct ScriptedRoots(Mutex<VecDeque<Vec<Certificate>>>);

#[async_trait]
impl RootCaSource for ScriptedRoots {
    async fn fetch_root_certificates(&self) -> Result<Vec<Certificate>> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PkiError::Service("no more root sets".to_string()))
    }
}

#[tokio::test]
async fn test_root_rotation_reaches_client_trust() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let clock = Arc::new(ManualClock::starting_now());
    let ca = Arc::new(StubCa::new(clock.clone(), &[100]));
    let client = datanode(&config, ca.clone(), clock.clone());
    client.ensure_initialized().await.unwrap();

    // Distinct serial so both roots coexist in the trust directory
    let now = clock.now();
    let next_keypair = generate_ed25519_keypair().unwrap();
    let next_root =
        create_root_certificate(&next_keypair, "CN=Next Root", SerialId::from(2u64), now, now + DAY)
            .unwrap();
    let source = Arc::new(ScriptedRoots(Mutex::new(VecDeque::from(vec![
        vec![ca.root.clone()],
        vec![ca.root.clone(), next_root.clone()],
    ]))));

    let poller = RootCaRotationPoller::new(source, Duration::from_millis(20));
    let sets = Arc::new(Mutex::new(Vec::new()));
    let recorder = sets.clone();
    poller.add_consumer(move |roots| recorder.lock().unwrap().push(roots.len()));
    poller.add_consumer(client.root_ca_consumer());
    poller.start().unwrap();

    for _ in 0..100 {
        if sets.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    poller.close().await;

    assert_eq!(*sets.lock().unwrap(), vec![1, 2]);
    assert_eq!(
        client.root_ca_certificate().unwrap().serial_id(),
        SerialId::from(2u64)
    );
    assert!(client
        .layout()
        .trust_dir
        .join("ROOTCA-2.crt")
        .exists());
}

#[test]
fn test_import_externally_generated_root() {
    let temp_dir = TempDir::new().unwrap();

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
    params.alg = &rcgen::PKCS_ED25519;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "External Root");
    let external = rcgen::Certificate::from_params(params).unwrap();

    let cert_path = temp_dir.path().join("external-root.crt");
    let key_path = temp_dir.path().join("external-root.key");
    let cert_pem = external.serialize_pem().unwrap();
    fs::write(&cert_path, &cert_pem).unwrap();
    fs::write(&key_path, external.serialize_private_key_pem()).unwrap();

    let mut config = SecurityConfig::with_metadata_dir(temp_dir.path().join("meta"));
    config.external_root_ca_cert = Some(cert_path);
    config.external_root_ca_private_key = Some(key_path);

    let ca = CertificateAuthority::bootstrap_root(&config, "CN=ignored").unwrap();
    let root = ca.root_certificate();
    assert!(root.is_self_signed());
    assert!(root.subject_name().contains("External Root"));
    assert_eq!(*root, codec::decode_certificate(&cert_pem).unwrap());
}
