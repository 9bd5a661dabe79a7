//! X.509 certificate construction and Ed25519 signing using x509-cert.
//!
//! A CA signs subordinate and leaf certificates with its own key, so the
//! resulting certificates form a verifiable chain of trust back to the root.

use crate::cert::chain::SerialId;
use crate::crypto::ed25519::Keypair;
use crate::error::{PkiError, Result};
use const_oid::AssociatedOid;
use der::asn1::{BitString, GeneralizedTime, Ia5String, OctetString, UtcTime};
use der::{DateTime, Encode};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName,
};
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence};
use x509_cert::time::{Time, Validity};

/// Everything that goes into a certificate besides keys and issuer.
#[derive(Debug, Clone)]
pub struct CertificateParams {
    pub serial: SerialId,
    pub subject: Name,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub extensions: Vec<Extension>,
}

/// Sign a certificate for `subject_key`.
///
/// With `issuer == None` the certificate is self-signed: the issuer name is
/// the subject and `issuer_key` must belong to `subject_key`.
pub fn sign_certificate(
    params: &CertificateParams,
    subject_key: &VerifyingKey,
    issuer: Option<&Certificate>,
    issuer_key: &SigningKey,
) -> Result<Certificate> {
    let issuer_name = match issuer {
        Some(ca_cert) => ca_cert.tbs_certificate.subject.clone(),
        None => params.subject.clone(),
    };
    let signature_algorithm = ed25519_algorithm();

    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number: params.serial.to_serial_number()?,
        signature: signature_algorithm.clone(),
        issuer: issuer_name,
        validity: create_validity(params.not_before, params.not_after)?,
        subject: params.subject.clone(),
        subject_public_key_info: create_subject_public_key_info(subject_key)?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: if params.extensions.is_empty() {
            None
        } else {
            Some(params.extensions.clone())
        },
    };

    // Sign with the issuer's key, not the subject's
    let signature = sign_tbs(&tbs, issuer_key)?;

    Ok(Certificate {
        tbs_certificate: tbs,
        signature_algorithm,
        signature,
    })
}

/// Create a self-signed root CA certificate with explicit serial and validity.
pub fn create_root_certificate(
    keypair: &Keypair,
    subject: &str,
    serial: SerialId,
    not_before: SystemTime,
    not_after: SystemTime,
) -> Result<Certificate> {
    let params = CertificateParams {
        serial,
        subject: create_name(subject)?,
        not_before,
        not_after,
        extensions: ca_extensions(None)?,
    };
    sign_certificate(&params, &keypair.public, None, &keypair.secret)
}

/// Create a self-signed Root CA certificate valid from `not_before` for
/// `validity_days`.
///
/// # Arguments
///
/// * `keypair` - The Ed25519 keypair for the Root CA
/// * `subject` - Distinguished name (e.g., "CN=Cluster Root CA,O=Storage") or a bare common name
/// * `not_before` - Start of validity, normally the caller's clock reading
/// * `validity_days` - Number of days the certificate is valid
///
/// # Example
///
/// ```
/// use cluster_pki::cert::chain::CertificateExt;
/// use cluster_pki::cert::x509_signing::create_self_signed_ca;
/// use cluster_pki::crypto::ed25519::generate_ed25519_keypair;
/// use std::time::SystemTime;
///
/// # fn example() -> cluster_pki::error::Result<()> {
/// let keypair = generate_ed25519_keypair()?;
/// let root = create_self_signed_ca(&keypair, "CN=My Root CA", SystemTime::now(), 3650)?;
/// assert!(root.is_self_signed());
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub fn create_self_signed_ca(
    keypair: &Keypair,
    subject: &str,
    not_before: SystemTime,
    validity_days: u32,
) -> Result<Certificate> {
    create_root_certificate(
        keypair,
        subject,
        random_serial(),
        not_before,
        not_before + days(validity_days),
    )
}

/// Issue a certificate for `subject_key` signed by `ca_keypair`, valid from
/// `not_before`.
///
/// `is_ca` selects CA extensions (basic constraints, cert signing) versus
/// leaf extensions (TLS client and server authentication).
pub fn issue_certificate(
    subject_key: &VerifyingKey,
    subject: &str,
    ca_keypair: &Keypair,
    ca_cert: &Certificate,
    is_ca: bool,
    not_before: SystemTime,
    validity_days: u32,
) -> Result<Certificate> {
    let extensions = if is_ca {
        ca_extensions(Some(0))?
    } else {
        leaf_extensions(&[])?
    };
    let params = CertificateParams {
        serial: random_serial(),
        subject: create_name(subject)?,
        not_before,
        not_after: not_before + days(validity_days),
        extensions,
    };
    sign_certificate(&params, subject_key, Some(ca_cert), &ca_keypair.secret)
}

/// Parse an RFC 4514 distinguished name; a string without `=` becomes a bare CN.
pub fn create_name(subject: &str) -> Result<Name> {
    let dn = if subject.contains('=') {
        subject.to_string()
    } else {
        format!("CN={}", subject)
    };
    RdnSequence::from_str(&dn)
        .map_err(|e| PkiError::Certificate(format!("Invalid subject {:?}: {}", subject, e)))
}

/// Wrap an extension value with its OID.
pub fn make_extension<T: AssociatedOid + Encode>(value: &T, critical: bool) -> Result<Extension> {
    let der = value
        .to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode extension {}: {}", T::OID, e)))?;
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(der)
            .map_err(|e| PkiError::Encoding(format!("Failed to wrap extension: {}", e)))?,
    })
}

/// Basic constraints plus certificate and CRL signing.
pub fn ca_extensions(path_len: Option<u8>) -> Result<Vec<Extension>> {
    Ok(vec![
        make_extension(
            &BasicConstraints {
                ca: true,
                path_len_constraint: path_len,
            },
            true,
        )?,
        make_extension(
            &KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature),
            true,
        )?,
    ])
}

/// Leaf extensions for mutual TLS, with the given alternative names.
pub fn leaf_extensions(alt_names: &[GeneralName]) -> Result<Vec<Extension>> {
    let mut extensions = vec![
        make_extension(
            &BasicConstraints {
                ca: false,
                path_len_constraint: None,
            },
            true,
        )?,
        make_extension(
            &KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment),
            true,
        )?,
        make_extension(
            &ExtendedKeyUsage(vec![
                const_oid::db::rfc5280::ID_KP_SERVER_AUTH,
                const_oid::db::rfc5280::ID_KP_CLIENT_AUTH,
            ]),
            false,
        )?,
    ];
    if !alt_names.is_empty() {
        extensions.push(make_extension(&SubjectAltName(alt_names.to_vec()), false)?);
    }
    Ok(extensions)
}

/// A DNS subject alternative name.
pub fn dns_name(name: &str) -> Result<GeneralName> {
    Ia5String::new(name)
        .map(GeneralName::DnsName)
        .map_err(|e| PkiError::Certificate(format!("Invalid DNS name {:?}: {}", name, e)))
}

/// An IP address subject alternative name.
pub fn ip_address(addr: IpAddr) -> Result<GeneralName> {
    let bytes = match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    OctetString::new(bytes)
        .map(GeneralName::IpAddress)
        .map_err(|e| PkiError::Certificate(format!("Invalid IP address: {}", e)))
}

/// Encode a point in time, as UTCTime through 2049 and GeneralizedTime after.
pub fn to_x509_time(time: SystemTime) -> Result<Time> {
    let date_time = DateTime::from_system_time(time)
        .map_err(|e| PkiError::Certificate(format!("Time out of range: {}", e)))?;
    if date_time.year() < 2050 {
        UtcTime::from_date_time(date_time)
            .map(Time::UtcTime)
            .map_err(|e| PkiError::Certificate(format!("Invalid UTC time: {}", e)))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    }
}

// Helper functions

fn random_serial() -> SerialId {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    bytes[0] &= 0x7F;
    bytes[0] |= 0x01;
    SerialId::from_be_bytes(&bytes)
}

fn days(count: u32) -> Duration {
    Duration::from_secs(u64::from(count) * 86400)
}

fn create_validity(not_before: SystemTime, not_after: SystemTime) -> Result<Validity> {
    if not_after <= not_before {
        return Err(PkiError::Certificate(
            "notAfter must be later than notBefore".to_string(),
        ));
    }
    Ok(Validity {
        not_before: to_x509_time(not_before)?,
        not_after: to_x509_time(not_after)?,
    })
}

pub(crate) fn create_subject_public_key_info(
    public_key: &VerifyingKey,
) -> Result<SubjectPublicKeyInfoOwned> {
    let subject_public_key = BitString::from_bytes(&public_key.to_bytes())
        .map_err(|e| PkiError::Encoding(format!("Failed to create bit string: {}", e)))?;

    Ok(SubjectPublicKeyInfoOwned {
        algorithm: ed25519_algorithm(),
        subject_public_key,
    })
}

pub(crate) fn ed25519_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: const_oid::db::rfc8410::ID_ED_25519,
        parameters: None,
    }
}

fn sign_tbs(tbs: &TbsCertificate, signing_key: &SigningKey) -> Result<BitString> {
    let tbs_der = tbs
        .to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode TBS: {}", e)))?;

    let signature = signing_key.sign(&tbs_der);
    BitString::from_bytes(&signature.to_bytes())
        .map_err(|e| PkiError::Signing(format!("Failed to create signature bitstring: {}", e)))
}
