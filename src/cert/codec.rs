//! PEM encoding and decoding of certificates and certificate chains.
//!
//! A chain is serialized as its certificates' PEM blocks in chain order
//! (leaf first), joined by a newline. All functions here are pure.

use crate::cert::chain::CertificateChain;
use crate::error::{PkiError, Result};
use der::{Decode, Encode};
use x509_cert::certificate::Certificate;

/// PEM label of an X.509 certificate.
pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Encode every certificate of `chain` as PEM, leaf first.
///
/// # Example
///
/// ```
/// use cluster_pki::cert::chain::CertificateChain;
/// use cluster_pki::cert::codec::{decode, encode};
/// use cluster_pki::cert::x509_signing::create_self_signed_ca;
/// use cluster_pki::crypto::ed25519::generate_ed25519_keypair;
/// use std::time::SystemTime;
///
/// # fn example() -> cluster_pki::error::Result<()> {
/// let keypair = generate_ed25519_keypair()?;
/// let root = CertificateChain::single(create_self_signed_ca(
///     &keypair,
///     "CN=Root CA",
///     SystemTime::now(),
///     365,
/// )?);
/// let pem = encode(&root)?;
/// assert_eq!(decode(&pem)?, root);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub fn encode(chain: &CertificateChain) -> Result<String> {
    let blocks = chain
        .iter()
        .map(to_pem_block)
        .collect::<Result<Vec<_>>>()?;
    Ok(blocks.join("\n"))
}

/// Encode a single certificate as one PEM block.
pub fn encode_certificate(cert: &Certificate) -> Result<String> {
    to_pem_block(cert)
}

/// Decode all certificates in `pem_str`, preserving file order.
pub fn decode(pem_str: &str) -> Result<CertificateChain> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| PkiError::Decode(format!("Failed to parse PEM: {}", e)))?;

    let certificates = blocks
        .iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_TAG {
                return Err(PkiError::Decode(format!(
                    "Expected {}, got {}",
                    CERTIFICATE_TAG,
                    block.tag()
                )));
            }
            Certificate::from_der(block.contents())
                .map_err(|e| PkiError::Decode(format!("Failed to decode certificate: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;

    if certificates.is_empty() {
        return Err(PkiError::Decode(
            "no certificate found in PEM input".to_string(),
        ));
    }
    CertificateChain::new(certificates)
}

/// Decode the first certificate in `pem_str`.
pub fn decode_certificate(pem_str: &str) -> Result<Certificate> {
    Ok(decode(pem_str)?.into_vec().swap_remove(0))
}

/// A new chain with `cert` placed first.
pub fn prepend(cert: Certificate, chain: &CertificateChain) -> CertificateChain {
    chain.prepend(cert)
}

/// DER bytes of a certificate, for TLS stacks that want raw certificates.
pub fn to_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.to_der()
        .map_err(|e| PkiError::Encoding(format!("Failed to encode certificate: {}", e)))
}

fn to_pem_block(cert: &Certificate) -> Result<String> {
    let der = to_der(cert)?;
    Ok(pem::encode_config(
        &pem::Pem::new(CERTIFICATE_TAG, der),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}
