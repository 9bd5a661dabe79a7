//! TLS key material that follows certificate renewals.
//!
//! [`ReloadingKeyManager`] serves a component's key and certificate chain to
//! rustls, both as client certificate resolver and as server certificate
//! resolver. The material lives in an immutable [`KeyDelegate`] that is
//! replaced with a single atomic swap when the component's certificate is
//! renewed, so handshakes already under way keep the delegate they started
//! with and new ones pick up the new key.

use crate::cert::chain::{CertificateExt, SerialId};
use crate::cert::codec;
use crate::client::{CertificateNotification, IdentityHandle, IdentitySnapshot};
use crate::crypto::ed25519::private_key_to_pkcs8_der;
use crate::error::{PkiError, Result};
use arc_swap::ArcSwap;
use der::Encode;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One generation of TLS key material.
pub struct KeyDelegate {
    alias: String,
    serial: SerialId,
    issuer_names: Vec<Vec<u8>>,
    certified_key: Arc<CertifiedKey>,
}

impl KeyDelegate {
    /// Build a delegate from a component's identity.
    pub fn from_identity(component: &str, identity: &IdentitySnapshot) -> Result<Self> {
        let (Some(secret), Some(chain)) = (&identity.private_key, &identity.chain) else {
            return Err(PkiError::Initialization(format!(
                "{} has no key pair and certificate to serve",
                component
            )));
        };

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key_to_pkcs8_der(
            secret,
        )?));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| PkiError::InvalidKey(format!("Unsupported TLS key: {}", e)))?;

        let certs = chain
            .iter()
            .map(|cert| codec::to_der(cert).map(CertificateDer::from))
            .collect::<Result<Vec<_>>>()?;
        let issuer_names = chain
            .iter()
            .map(|cert| {
                cert.tbs_certificate.issuer.to_der().map_err(|e| {
                    PkiError::Encoding(format!("Failed to encode issuer name: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let serial = chain.leaf().serial_id();
        Ok(Self {
            alias: format!("{}/{}", component, serial).to_lowercase(),
            serial,
            issuer_names,
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn serial(&self) -> &SerialId {
        &self.serial
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// Whether any certificate of the chain was issued by one of `issuers`
    /// (DER encoded names). An empty list accepts any issuer.
    fn issued_by_any(&self, issuers: &[&[u8]]) -> bool {
        issuers.is_empty()
            || self
                .issuer_names
                .iter()
                .any(|name| issuers.contains(&name.as_slice()))
    }
}

impl fmt::Debug for KeyDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDelegate")
            .field("alias", &self.alias)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// rustls certificate resolver whose key material is swapped on renewal.
pub struct ReloadingKeyManager {
    identity: IdentityHandle,
    current: ArcSwap<KeyDelegate>,
}

impl ReloadingKeyManager {
    /// Create a manager serving the identity's current key and chain.
    pub fn new(identity: IdentityHandle) -> Result<Self> {
        let delegate = KeyDelegate::from_identity(identity.component_name(), &identity.load())?;
        info!(alias = %delegate.alias, "key manager loaded");
        Ok(Self {
            identity,
            current: ArcSwap::from_pointee(delegate),
        })
    }

    /// The delegate serving handshakes right now.
    pub fn current(&self) -> Arc<KeyDelegate> {
        self.current.load_full()
    }

    /// Rebuild the delegate from the identity and publish it.
    pub fn reload(&self) -> Result<Arc<KeyDelegate>> {
        let delegate = Arc::new(KeyDelegate::from_identity(
            self.identity.component_name(),
            &self.identity.load(),
        )?);
        let previous = self.current.swap(delegate.clone());
        info!(old = %previous.alias, new = %delegate.alias, "key manager reloaded");
        Ok(delegate)
    }

    /// Alias to present as a client given the CA names the server accepts.
    ///
    /// When the current chain matches none of them, typically because the peer
    /// has not caught up with a rotation yet, the current alias is used anyway.
    pub fn choose_client_alias(&self, issuers: &[&[u8]]) -> String {
        let delegate = self.current();
        if !delegate.issued_by_any(issuers) {
            debug!(alias = %delegate.alias, "no chain matches the requested issuers, using default alias");
        }
        delegate.alias.clone()
    }

    pub fn choose_server_alias(&self) -> String {
        self.current().alias.clone()
    }

    /// Certificate chain for `alias`, compared case-insensitively.
    pub fn certificate_chain(&self, alias: &str) -> Vec<CertificateDer<'static>> {
        self.delegate_for(alias).certificate_chain().to_vec()
    }

    /// Signing key and chain for `alias`, compared case-insensitively.
    pub fn certified_key(&self, alias: &str) -> Arc<CertifiedKey> {
        self.delegate_for(alias).certified_key()
    }

    /// The delegate for `alias`, or the current one when the alias belongs
    /// to a generation that has been replaced.
    pub fn delegate_for(&self, alias: &str) -> Arc<KeyDelegate> {
        let delegate = self.current();
        if !delegate.alias.eq_ignore_ascii_case(alias) {
            debug!(requested = %alias, current = %delegate.alias, "unknown alias, falling back to current");
        }
        delegate
    }
}

impl fmt::Debug for ReloadingKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingKeyManager")
            .field("current", &self.current())
            .finish()
    }
}

impl CertificateNotification for ReloadingKeyManager {
    fn notify_certificate_renewed(
        &self,
        component: &str,
        old_serial: Option<&SerialId>,
        new_serial: &SerialId,
    ) -> Result<()> {
        let delegate = self.reload()?;
        if delegate.serial() != new_serial {
            warn!(
                component,
                expected = %new_serial,
                loaded = %delegate.serial(),
                "reloaded key material does not carry the renewed serial"
            );
        }
        debug!(component, old_serial = ?old_serial, new_serial = %new_serial, "key manager followed renewal");
        Ok(())
    }
}

impl ResolvesClientCert for ReloadingKeyManager {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let alias = self.choose_client_alias(root_hint_subjects);
        Some(self.certified_key(&alias))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for ReloadingKeyManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let alias = self.choose_server_alias();
        Some(self.certified_key(&alias))
    }
}
