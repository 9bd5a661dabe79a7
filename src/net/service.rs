//! The certificate service consumed by clients.
//!
//! Clients talk to their CA through [`CertificateService`]. The transport is
//! left to the implementor; [`LocalCaService`] serves requests from an
//! in-process [`CertificateAuthority`].

use crate::ca::{CertificateAuthority, RevocationList};
use crate::cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
use crate::cert::codec;
use crate::error::{PkiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identity of the node asking for a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub role: CertRole,
}

impl NodeDescriptor {
    pub fn leaf(node_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            ip_address: None,
            role: CertRole::Leaf,
        }
    }
}

/// Reply to a signing request, all members PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCertificateResponse {
    /// The new certificate followed by its issuers.
    pub leaf_chain_pem: String,
    /// The issuing CA's certificate (and its issuers).
    pub ca_chain_pem: String,
    /// The root certificate, when the service includes it.
    pub root_chain_pem: Option<String>,
}

/// Certificate operations offered by a CA.
#[async_trait]
pub trait CertificateService: Send + Sync {
    /// Submit a PEM CSR and receive the signed chain.
    async fn submit_csr(
        &self,
        node: &NodeDescriptor,
        csr_pem: &str,
    ) -> Result<SignedCertificateResponse>;

    /// PEM of the certificate with `serial`.
    async fn get_certificate(&self, serial: &SerialId) -> Result<String>;

    /// PEM certificates of `role` after `start`, at most `count`.
    async fn list_certificates(
        &self,
        role: CertRole,
        start: Option<SerialId>,
        count: usize,
    ) -> Result<Vec<String>>;

    /// PEM of every CA (non-root) certificate the service knows.
    async fn list_ca_certificates(&self) -> Result<Vec<String>>;

    /// PEM of every root certificate currently trusted by the CA.
    async fn all_root_ca_certificates(&self) -> Result<Vec<String>>;

    /// The CA's current revocation list.
    async fn latest_crl(&self) -> Result<RevocationList>;
}

/// Serves requests directly from a [`CertificateAuthority`].
#[derive(Debug, Clone)]
pub struct LocalCaService {
    ca: Arc<CertificateAuthority>,
    validity: Duration,
    include_root: bool,
}

impl LocalCaService {
    pub fn new(ca: Arc<CertificateAuthority>, validity: Duration) -> Self {
        Self {
            ca,
            validity,
            include_root: true,
        }
    }

    /// Whether replies carry the root certificate.
    pub fn with_root_in_response(mut self, include_root: bool) -> Self {
        self.include_root = include_root;
        self
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

#[async_trait]
impl CertificateService for LocalCaService {
    async fn submit_csr(
        &self,
        node: &NodeDescriptor,
        csr_pem: &str,
    ) -> Result<SignedCertificateResponse> {
        debug!(node = %node.node_id, role = %node.role, "signing request");
        let chain = self.ca.issue_chain(csr_pem, self.validity, node.role)?;
        let root_chain_pem = if self.include_root {
            Some(codec::encode(&CertificateChain::single(
                self.ca.root_certificate().clone(),
            ))?)
        } else {
            None
        };
        Ok(SignedCertificateResponse {
            leaf_chain_pem: codec::encode(&chain)?,
            ca_chain_pem: codec::encode(self.ca.ca_chain())?,
            root_chain_pem,
        })
    }

    async fn get_certificate(&self, serial: &SerialId) -> Result<String> {
        let cert = self
            .ca
            .certificate_by_serial(serial)
            .ok_or_else(|| PkiError::NotFound(format!("certificate {}", serial)))?;
        codec::encode_certificate(&cert)
    }

    async fn list_certificates(
        &self,
        role: CertRole,
        start: Option<SerialId>,
        count: usize,
    ) -> Result<Vec<String>> {
        self.ca
            .list_by_role(role, start.as_ref(), count)
            .iter()
            .map(codec::encode_certificate)
            .collect()
    }

    async fn list_ca_certificates(&self) -> Result<Vec<String>> {
        let mut certificates: Vec<_> = self
            .ca
            .ca_chain()
            .iter()
            .filter(|c| c.role() == CertRole::Subordinate)
            .cloned()
            .collect();
        certificates.extend(self.ca.list_by_role(CertRole::Subordinate, None, usize::MAX));
        certificates.iter().map(codec::encode_certificate).collect()
    }

    async fn all_root_ca_certificates(&self) -> Result<Vec<String>> {
        self.ca
            .all_root_certificates()?
            .iter()
            .map(codec::encode_certificate)
            .collect()
    }

    async fn latest_crl(&self) -> Result<RevocationList> {
        Ok(self.ca.crl())
    }
}
