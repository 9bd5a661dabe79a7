//! PKCS#10 certificate signing requests.
//!
//! Nodes ask the CA for a certificate by sending a CSR that carries their
//! subject, public key and the extensions they would like (alternative names,
//! key usages). The request is self-signed, proving possession of the key.

use crate::cert::chain::CertRole;
use crate::cert::x509_signing::{
    create_name, create_subject_public_key_info, ed25519_algorithm, make_extension,
};
use crate::crypto::ed25519::{verifying_key_from_bytes, Keypair};
use crate::error::{PkiError, Result};
use const_oid::AssociatedOid;
use der::asn1::{BitString, SetOfVec};
use der::{Any, Decode, Encode};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAltName};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::{CertReq, CertReqInfo, ExtensionReq, Version};

/// PEM label of a certificate signing request.
pub const CSR_TAG: &str = "CERTIFICATE REQUEST";

/// Extensions requested by a CSR.
#[derive(Debug, Clone, Default)]
pub struct RequestedExtensions {
    pub alt_names: Vec<GeneralName>,
    pub key_usage: Option<KeyUsage>,
    pub extended_key_usage: Option<ExtendedKeyUsage>,
    pub basic_constraints: Option<BasicConstraints>,
}

/// A parsed and signature-checked CSR.
#[derive(Debug, Clone)]
pub struct CsrInfo {
    pub subject: Name,
    pub public_key: VerifyingKey,
    pub requested: RequestedExtensions,
}

impl CsrInfo {
    /// The common name of the subject, if any.
    pub fn common_name(&self) -> Option<String> {
        self.subject.0.iter().flat_map(|rdn| rdn.0.iter()).find_map(|atv| {
            if atv.oid != const_oid::db::rfc4519::CN {
                return None;
            }
            der::asn1::Utf8StringRef::try_from(&atv.value)
                .map(|s| s.as_str().to_string())
                .ok()
                .or_else(|| {
                    der::asn1::PrintableStringRef::try_from(&atv.value)
                        .map(|s| s.as_str().to_string())
                        .ok()
                })
        })
    }

    /// Whether the request asks for CA capabilities.
    pub fn requests_ca(&self) -> bool {
        matches!(
            self.requested.basic_constraints,
            Some(BasicConstraints { ca: true, .. })
        )
    }
}

/// Build a CSR for `role` and return it PEM encoded.
///
/// Subordinate requests carry a CA basic constraint; leaf requests carry the
/// given alternative names.
pub fn build_csr(
    keypair: &Keypair,
    subject: &str,
    role: CertRole,
    alt_names: &[GeneralName],
) -> Result<String> {
    let mut extensions: Vec<Extension> = Vec::new();
    match role {
        CertRole::Subordinate | CertRole::Root => {
            extensions.push(make_extension(
                &BasicConstraints {
                    ca: true,
                    path_len_constraint: Some(0),
                },
                true,
            )?);
        }
        CertRole::Leaf => {
            if !alt_names.is_empty() {
                extensions.push(make_extension(&SubjectAltName(alt_names.to_vec()), false)?);
            }
        }
    }

    let mut attributes = SetOfVec::new();
    if !extensions.is_empty() {
        let value = Any::encode_from(&ExtensionReq(extensions))
            .map_err(|e| PkiError::Encoding(format!("Failed to encode extension request: {}", e)))?;
        let values = SetOfVec::try_from(vec![value])
            .map_err(|e| PkiError::Encoding(format!("Failed to build attribute: {}", e)))?;
        attributes
            .insert_ordered(Attribute {
                oid: ExtensionReq::OID,
                values,
            })
            .map_err(|e| PkiError::Encoding(format!("Failed to add attribute: {}", e)))?;
    }

    let info = CertReqInfo {
        version: Version::V1,
        subject: create_name(subject)?,
        public_key: create_subject_public_key_info(&keypair.public)?,
        attributes,
    };
    let info_der = info
        .to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode CSR info: {}", e)))?;
    let signature = BitString::from_bytes(&keypair.secret.sign(&info_der).to_bytes())
        .map_err(|e| PkiError::Signing(format!("Failed to create CSR signature: {}", e)))?;

    let request = CertReq {
        info,
        algorithm: ed25519_algorithm(),
        signature,
    };
    let der = request
        .to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode CSR: {}", e)))?;
    Ok(pem::encode_config(
        &pem::Pem::new(CSR_TAG, der),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}

/// Parse a PEM CSR and verify its self-signature.
pub fn parse_csr(pem_str: &str) -> Result<CsrInfo> {
    let block = pem::parse(pem_str)
        .map_err(|e| PkiError::Decode(format!("Failed to parse CSR PEM: {}", e)))?;
    if block.tag() != CSR_TAG {
        return Err(PkiError::Decode(format!(
            "Expected {}, got {}",
            CSR_TAG,
            block.tag()
        )));
    }
    let request = CertReq::from_der(block.contents())
        .map_err(|e| PkiError::Decode(format!("Failed to decode CSR: {}", e)))?;

    let spki = &request.info.public_key;
    if spki.algorithm.oid != const_oid::db::rfc8410::ID_ED_25519 {
        return Err(PkiError::PolicyViolation(format!(
            "Unsupported CSR key algorithm: {}",
            spki.algorithm.oid
        )));
    }
    let public_key = verifying_key_from_bytes(spki.subject_public_key.raw_bytes())?;

    let info_der = request
        .info
        .to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode CSR info: {}", e)))?;
    let signature = request
        .signature
        .as_bytes()
        .and_then(|bytes| Signature::from_slice(bytes).ok())
        .ok_or_else(|| PkiError::Decode("Malformed CSR signature".to_string()))?;
    public_key
        .verify(&info_der, &signature)
        .map_err(|_| PkiError::PolicyViolation("CSR signature does not verify".to_string()))?;

    Ok(CsrInfo {
        subject: request.info.subject.clone(),
        public_key,
        requested: requested_extensions(&request.info)?,
    })
}

fn requested_extensions(info: &CertReqInfo) -> Result<RequestedExtensions> {
    let mut requested = RequestedExtensions::default();
    for attribute in info.attributes.iter().filter(|a| a.oid == ExtensionReq::OID) {
        for value in attribute.values.iter() {
            let ext_req = decode_any::<ExtensionReq>(value)?;
            for ext in ext_req.0 {
                let bytes = ext.extn_value.as_bytes();
                match ext.extn_id {
                    oid if oid == SubjectAltName::OID => {
                        requested.alt_names.extend(decode_ext::<SubjectAltName>(bytes)?.0)
                    }
                    oid if oid == KeyUsage::OID => {
                        requested.key_usage = Some(decode_ext(bytes)?)
                    }
                    oid if oid == ExtendedKeyUsage::OID => {
                        requested.extended_key_usage = Some(decode_ext(bytes)?)
                    }
                    oid if oid == BasicConstraints::OID => {
                        requested.basic_constraints = Some(decode_ext(bytes)?)
                    }
                    other => {
                        return Err(PkiError::PolicyViolation(format!(
                            "Unsupported requested extension: {}",
                            other
                        )))
                    }
                }
            }
        }
    }
    Ok(requested)
}

fn decode_any<T: for<'a> Decode<'a>>(value: &Any) -> Result<T> {
    let der = value
        .to_der()
        .map_err(|e| PkiError::Decode(format!("Failed to re-encode attribute: {}", e)))?;
    T::from_der(&der).map_err(|e| PkiError::Decode(format!("Malformed attribute: {}", e)))
}

fn decode_ext<T: for<'a> Decode<'a>>(bytes: &[u8]) -> Result<T> {
    T::from_der(bytes).map_err(|e| PkiError::Decode(format!("Malformed extension: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::x509_signing::dns_name;
    use crate::crypto::ed25519::generate_ed25519_keypair;

    #[test]
    fn test_leaf_csr_roundtrip() {
        let keypair = generate_ed25519_keypair().unwrap();
        let csr = build_csr(
            &keypair,
            "CN=datanode-1,O=Cluster",
            CertRole::Leaf,
            &[dns_name("dn1.cluster.local").unwrap()],
        )
        .unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

        let info = parse_csr(&csr).unwrap();
        assert_eq!(info.public_key, keypair.public);
        assert_eq!(info.common_name().as_deref(), Some("datanode-1"));
        assert_eq!(info.requested.alt_names.len(), 1);
        assert!(!info.requests_ca());
    }

    #[test]
    fn test_subordinate_csr_requests_ca() {
        let keypair = generate_ed25519_keypair().unwrap();
        let csr = build_csr(&keypair, "CN=sub-ca", CertRole::Subordinate, &[]).unwrap();
        assert!(parse_csr(&csr).unwrap().requests_ca());
    }

    #[test]
    fn test_tampered_csr_is_rejected() {
        let keypair = generate_ed25519_keypair().unwrap();
        let csr = build_csr(&keypair, "CN=node", CertRole::Leaf, &[]).unwrap();

        let block = pem::parse(&csr).unwrap();
        let mut request = CertReq::from_der(block.contents()).unwrap();
        let other = generate_ed25519_keypair().unwrap();
        request.info.public_key = create_subject_public_key_info(&other.public).unwrap();
        let tampered = pem::encode(&pem::Pem::new(CSR_TAG, request.to_der().unwrap()));

        match parse_csr(&tampered) {
            Err(PkiError::PolicyViolation(msg)) => assert!(msg.contains("signature")),
            _ => panic!("Expected PolicyViolation"),
        }
    }

    #[test]
    fn test_wrong_pem_label() {
        let result = parse_csr("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        assert!(matches!(result, Err(PkiError::Decode(_))));
    }
}
