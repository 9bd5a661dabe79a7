//! rustls configuration for mutually authenticated connections.
//!
//! Both sides present their certificate through a [`ReloadingKeyManager`], so
//! a renewed certificate is used by the next handshake without rebuilding the
//! configuration. Trust anchors are the roots of a [`TrustStore`].

use crate::cert::codec;
use crate::error::{PkiError, Result};
use crate::net::key_manager::ReloadingKeyManager;
use crate::storage::trusted::TrustStore;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::debug;

/// Root certificate store holding every trusted root.
pub fn root_cert_store(trust: &TrustStore) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for root in trust.roots() {
        roots
            .add(CertificateDer::from(codec::to_der(root)?))
            .map_err(|e| PkiError::Certificate(format!("Failed to add CA cert: {:?}", e)))?;
    }
    if roots.is_empty() {
        return Err(PkiError::Certificate(
            "trust store holds no root certificate".to_string(),
        ));
    }
    debug!(roots = roots.len(), "built root certificate store");
    Ok(roots)
}

/// Client side configuration presenting the managed certificate.
pub fn build_client_config(
    key_manager: Arc<ReloadingKeyManager>,
    trust: &TrustStore,
) -> Result<Arc<ClientConfig>> {
    let roots = root_cert_store(trust)?;
    install_crypto_provider();

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_cert_resolver(key_manager);
    Ok(Arc::new(config))
}

/// Server side configuration requiring client certificates issued under
/// a trusted root.
pub fn build_server_config(
    key_manager: Arc<ReloadingKeyManager>,
    trust: &TrustStore,
) -> Result<Arc<ServerConfig>> {
    let roots = root_cert_store(trust)?;
    install_crypto_provider();

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| PkiError::Service(format!("Failed to build client verifier: {}", e)))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(key_manager);
    Ok(Arc::new(config))
}

fn install_crypto_provider() {
    // Another caller may have installed one already
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::Fixture;

    #[tokio::test]
    async fn test_build_configs() {
        let fixture = Fixture::new();
        let client = fixture.client("om");
        client.ensure_initialized().await.unwrap();
        let manager = Arc::new(ReloadingKeyManager::new(client.identity_handle()).unwrap());

        let trust = client.trust_store();
        let client_config = build_client_config(manager.clone(), &trust).unwrap();
        assert!(client_config.client_auth_cert_resolver.has_certs());
        assert!(build_server_config(manager, &trust).is_ok());
    }

    #[test]
    fn test_empty_trust_store_is_rejected() {
        match root_cert_store(&TrustStore::new()) {
            Err(PkiError::Certificate(_)) => {}
            _ => panic!("Expected Certificate error"),
        }
    }
}
