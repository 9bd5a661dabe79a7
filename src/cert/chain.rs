//! Certificate identity model: serial ids, roles, chains and the accessors
//! used to inspect an [`x509_cert::Certificate`].

use crate::crypto::ed25519::verifying_key_from_bytes;
use crate::error::{PkiError, Result};
use const_oid::AssociatedOid;
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use x509_cert::certificate::Certificate;
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::serial_number::SerialNumber;

/// Unsigned certificate serial number of arbitrary length.
///
/// Ordering is numeric, display is decimal.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SerialId(Vec<u8>);

impl SerialId {
    /// Build from big-endian magnitude bytes; leading zeros are ignored.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    /// Minimal big-endian magnitude (empty for zero).
    pub fn as_be_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as a positive DER serial number.
    pub fn to_serial_number(&self) -> Result<SerialNumber> {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        match self.0.first() {
            None => bytes.push(0),
            Some(first) if first & 0x80 != 0 => {
                bytes.push(0);
                bytes.extend_from_slice(&self.0);
            }
            Some(_) => bytes.extend_from_slice(&self.0),
        }
        SerialNumber::new(&bytes)
            .map_err(|e| PkiError::Encoding(format!("Failed to create serial number: {}", e)))
    }

    /// Next serial, used by issuers that hand out monotonically increasing ids.
    pub fn next(&self) -> Self {
        let mut bytes = self.0.clone();
        for byte in bytes.iter_mut().rev() {
            let (sum, carry) = byte.overflowing_add(1);
            *byte = sum;
            if !carry {
                return Self(bytes);
            }
        }
        bytes.insert(0, 1);
        Self(bytes)
    }
}

impl From<u64> for SerialId {
    fn from(value: u64) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }
}

impl From<&SerialNumber> for SerialId {
    fn from(serial: &SerialNumber) -> Self {
        Self::from_be_bytes(serial.as_bytes())
    }
}

impl Ord for SerialId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SerialId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("0");
        }
        // Repeated division of the big-endian magnitude by 10.
        let mut digits = Vec::new();
        let mut value = self.0.clone();
        while !value.is_empty() {
            let mut remainder = 0u32;
            for byte in value.iter_mut() {
                let acc = (remainder << 8) | u32::from(*byte);
                *byte = (acc / 10) as u8;
                remainder = acc % 10;
            }
            digits.push(b'0' + remainder as u8);
            let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
            value.drain(..start);
        }
        digits.reverse();
        f.write_str(&String::from_utf8_lossy(&digits))
    }
}

impl fmt::Debug for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialId({})", self)
    }
}

impl FromStr for SerialId {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PkiError::Decode(format!("Invalid serial id: {:?}", s)));
        }
        let mut value: Vec<u8> = Vec::new();
        for digit in s.bytes().map(|b| u32::from(b - b'0')) {
            let mut carry = digit;
            for byte in value.iter_mut().rev() {
                let acc = u32::from(*byte) * 10 + carry;
                *byte = (acc & 0xff) as u8;
                carry = acc >> 8;
            }
            while carry > 0 {
                value.insert(0, (carry & 0xff) as u8);
                carry >>= 8;
            }
        }
        Ok(Self::from_be_bytes(&value))
    }
}

impl From<SerialId> for String {
    fn from(serial: SerialId) -> Self {
        serial.to_string()
    }
}

impl TryFrom<String> for SerialId {
    type Error = PkiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Position of a certificate in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertRole {
    /// Self-signed trust anchor
    Root,
    /// CA certificate signed by another CA
    Subordinate,
    /// End-entity node certificate
    Leaf,
}

impl CertRole {
    /// File name prefix used when persisting a certificate of this role.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            CertRole::Root => "ROOTCA-",
            CertRole::Subordinate => "CA-",
            CertRole::Leaf => "",
        }
    }

    /// `<prefix><serial>.crt`
    pub fn file_name(&self, serial: &SerialId) -> String {
        format!("{}{}.crt", self.file_prefix(), serial)
    }

    /// Classify a stored file by its name prefix.
    pub fn from_file_name(name: &str) -> Option<CertRole> {
        let stem = name.strip_suffix(".crt")?;
        let (role, serial) = if let Some(rest) = stem.strip_prefix("ROOTCA-") {
            (CertRole::Root, rest)
        } else if let Some(rest) = stem.strip_prefix("CA-") {
            (CertRole::Subordinate, rest)
        } else {
            (CertRole::Leaf, stem)
        };
        serial.parse::<SerialId>().ok().map(|_| role)
    }
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertRole::Root => "root",
            CertRole::Subordinate => "subordinate",
            CertRole::Leaf => "leaf",
        };
        f.write_str(name)
    }
}

impl FromStr for CertRole {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "root" => Ok(CertRole::Root),
            "subordinate" | "ca" => Ok(CertRole::Subordinate),
            "leaf" => Ok(CertRole::Leaf),
            other => Err(PkiError::Decode(format!("Unknown certificate role: {}", other))),
        }
    }
}

/// Read-only accessors over a parsed certificate.
pub trait CertificateExt {
    fn serial_id(&self) -> SerialId;
    fn subject_name(&self) -> String;
    fn issuer_name(&self) -> String;
    fn not_before(&self) -> SystemTime;
    fn not_after(&self) -> SystemTime;
    /// The subject's Ed25519 public key.
    fn public_key(&self) -> Result<VerifyingKey>;
    /// Check this certificate's signature against `issuer_key`.
    fn verify_signed_by(&self, issuer_key: &VerifyingKey) -> Result<()>;
    /// Decode the extension of type `T`, if present.
    fn extension<T>(&self) -> Result<Option<T>>
    where
        T: for<'a> Decode<'a> + AssociatedOid;
    fn is_self_signed(&self) -> bool;
    fn is_ca(&self) -> bool;
    /// Role as determined by the certificate content.
    fn role(&self) -> CertRole;
    fn is_valid_at(&self, now: SystemTime) -> bool;
}

impl CertificateExt for Certificate {
    fn serial_id(&self) -> SerialId {
        SerialId::from(&self.tbs_certificate.serial_number)
    }

    fn subject_name(&self) -> String {
        self.tbs_certificate.subject.to_string()
    }

    fn issuer_name(&self) -> String {
        self.tbs_certificate.issuer.to_string()
    }

    fn not_before(&self) -> SystemTime {
        self.tbs_certificate.validity.not_before.to_system_time()
    }

    fn not_after(&self) -> SystemTime {
        self.tbs_certificate.validity.not_after.to_system_time()
    }

    fn public_key(&self) -> Result<VerifyingKey> {
        let spki = &self.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid != ED25519_OID {
            return Err(PkiError::InvalidKey(format!(
                "Unsupported public key algorithm: {}",
                spki.algorithm.oid
            )));
        }
        let bytes = spki.subject_public_key.as_bytes().ok_or_else(|| {
            PkiError::InvalidKey("Public key bit string has unused bits".to_string())
        })?;
        verifying_key_from_bytes(bytes)
    }

    fn verify_signed_by(&self, issuer_key: &VerifyingKey) -> Result<()> {
        if self.signature_algorithm.oid != ED25519_OID {
            return Err(PkiError::Certificate(format!(
                "Unsupported signature algorithm: {}",
                self.signature_algorithm.oid
            )));
        }
        let tbs_der = self
            .tbs_certificate
            .to_der()
            .map_err(|e| PkiError::Encoding(format!("Failed to encode TBS: {}", e)))?;
        let signature_bytes = self
            .signature
            .as_bytes()
            .ok_or_else(|| PkiError::Certificate("Malformed signature bit string".to_string()))?;
        let signature = Signature::from_slice(signature_bytes)
            .map_err(|e| PkiError::Certificate(format!("Malformed signature: {}", e)))?;
        issuer_key
            .verify(&tbs_der, &signature)
            .map_err(|e| PkiError::Certificate(format!("Signature verification failed: {}", e)))
    }

    fn extension<T>(&self) -> Result<Option<T>>
    where
        T: for<'a> Decode<'a> + AssociatedOid,
    {
        let Some(extensions) = self.tbs_certificate.extensions.as_ref() else {
            return Ok(None);
        };
        extensions
            .iter()
            .find(|ext| ext.extn_id == T::OID)
            .map(|ext| {
                T::from_der(ext.extn_value.as_bytes())
                    .map_err(|e| PkiError::Decode(format!("Malformed extension {}: {}", T::OID, e)))
            })
            .transpose()
    }

    fn is_self_signed(&self) -> bool {
        self.tbs_certificate.subject == self.tbs_certificate.issuer
            && self
                .public_key()
                .and_then(|key| self.verify_signed_by(&key))
                .is_ok()
    }

    fn is_ca(&self) -> bool {
        matches!(
            self.extension::<BasicConstraints>(),
            Ok(Some(BasicConstraints { ca: true, .. }))
        )
    }

    fn role(&self) -> CertRole {
        if self.is_self_signed() {
            CertRole::Root
        } else if self.is_ca() {
            CertRole::Subordinate
        } else {
            CertRole::Leaf
        }
    }

    fn is_valid_at(&self, now: SystemTime) -> bool {
        self.not_before() <= now && now <= self.not_after()
    }
}

const ED25519_OID: ObjectIdentifier = const_oid::db::rfc8410::ID_ED_25519;

/// An ordered certificate chain, leaf first.
///
/// A chain always holds at least one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    pub fn new(certificates: Vec<Certificate>) -> Result<Self> {
        if certificates.is_empty() {
            return Err(PkiError::Decode("certificate chain is empty".to_string()));
        }
        Ok(Self { certificates })
    }

    pub fn single(certificate: Certificate) -> Self {
        Self {
            certificates: vec![certificate],
        }
    }

    /// The first (end-entity) certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Certificate> {
        self.certificates.iter()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// A new chain with `certificate` in front; `self` is left untouched.
    pub fn prepend(&self, certificate: Certificate) -> Self {
        let mut certificates = Vec::with_capacity(self.certificates.len() + 1);
        certificates.push(certificate);
        certificates.extend(self.certificates.iter().cloned());
        Self { certificates }
    }

    /// Check that every certificate is issued by the one that follows it.
    pub fn validate_links(&self) -> Result<()> {
        for pair in self.certificates.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            if child.tbs_certificate.issuer != parent.tbs_certificate.subject {
                return Err(PkiError::Certificate(format!(
                    "chain break: issuer of {} is not {}",
                    child.serial_id(),
                    parent.subject_name()
                )));
            }
            child.verify_signed_by(&parent.public_key()?)?;
        }
        Ok(())
    }

    pub fn into_vec(self) -> Vec<Certificate> {
        self.certificates
    }
}

impl<'a> IntoIterator for &'a CertificateChain {
    type Item = &'a Certificate;
    type IntoIter = std::slice::Iter<'a, Certificate>;

    fn into_iter(self) -> Self::IntoIter {
        self.certificates.iter()
    }
}
