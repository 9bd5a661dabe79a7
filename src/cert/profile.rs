//! Issuance policy.
//!
//! A profile decides whether a CSR may be signed for a given role and which
//! extensions the resulting certificate carries. The CA consults its profile
//! for every request; requests that fail validation are rejected with
//! `PolicyViolation`.

use crate::cert::chain::CertRole;
use crate::cert::csr::CsrInfo;
use crate::cert::x509_signing::{ca_extensions, leaf_extensions};
use crate::error::{PkiError, Result};
use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::KeyUsages;
use x509_cert::ext::Extension;

/// Policy applied by a certificate authority to incoming requests.
pub trait PkiProfile: Send + Sync {
    /// Reject requests that this profile does not allow for `role`.
    fn validate(&self, csr: &CsrInfo, role: CertRole) -> Result<()>;

    /// Extensions placed in the certificate issued for `csr`.
    fn extensions_for(&self, csr: &CsrInfo, role: CertRole) -> Result<Vec<Extension>>;
}

/// Profile used by cluster CAs: DNS and IP alternative names only, no
/// wildcards, TLS client/server usages for leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProfile;

impl PkiProfile for DefaultProfile {
    fn validate(&self, csr: &CsrInfo, role: CertRole) -> Result<()> {
        if csr.common_name().map_or(true, |cn| cn.trim().is_empty()) {
            return Err(PkiError::PolicyViolation(
                "subject must carry a non-empty common name".to_string(),
            ));
        }

        for name in &csr.requested.alt_names {
            match name {
                GeneralName::DnsName(dns) => {
                    let dns = dns.as_str();
                    if dns.is_empty() || dns.contains('*') {
                        return Err(PkiError::PolicyViolation(format!(
                            "DNS name {:?} is not allowed",
                            dns
                        )));
                    }
                }
                GeneralName::IpAddress(ip) => {
                    let len = ip.as_bytes().len();
                    if len != 4 && len != 16 {
                        return Err(PkiError::PolicyViolation(format!(
                            "IP address of {} bytes is not allowed",
                            len
                        )));
                    }
                }
                _ => {
                    return Err(PkiError::PolicyViolation(
                        "only DNS and IP alternative names are allowed".to_string(),
                    ))
                }
            }
        }

        let allowed_usages = match role {
            CertRole::Leaf => KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment,
            CertRole::Subordinate | CertRole::Root => {
                KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature
            }
        };
        if let Some(ku) = &csr.requested.key_usage {
            if !allowed_usages.contains(ku.0) {
                return Err(PkiError::PolicyViolation(format!(
                    "key usage {:?} not allowed for {} certificates",
                    ku.0, role
                )));
            }
        }

        if let Some(eku) = &csr.requested.extended_key_usage {
            if role != CertRole::Leaf {
                return Err(PkiError::PolicyViolation(
                    "extended key usage may only be requested for leaf certificates".to_string(),
                ));
            }
            if let Some(oid) = eku
                .0
                .iter()
                .find(|oid| **oid != ID_KP_SERVER_AUTH && **oid != ID_KP_CLIENT_AUTH)
            {
                return Err(PkiError::PolicyViolation(format!(
                    "extended key usage {} not allowed",
                    oid
                )));
            }
        }

        match role {
            CertRole::Leaf if csr.requests_ca() => Err(PkiError::PolicyViolation(
                "leaf certificates cannot be CAs".to_string(),
            )),
            CertRole::Subordinate if !csr.requests_ca() => Err(PkiError::PolicyViolation(
                "subordinate CA request must ask for CA basic constraints".to_string(),
            )),
            CertRole::Root => Err(PkiError::PolicyViolation(
                "root certificates are self-signed, not issued".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn extensions_for(&self, csr: &CsrInfo, role: CertRole) -> Result<Vec<Extension>> {
        match role {
            CertRole::Leaf => leaf_extensions(&csr.requested.alt_names),
            CertRole::Subordinate | CertRole::Root => ca_extensions(Some(0)),
        }
    }
}
