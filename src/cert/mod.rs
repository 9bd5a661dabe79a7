//! Certificate model, codecs, signing and issuance policy.

pub mod chain;
pub mod codec;
pub mod csr;
pub mod profile;
pub mod x509_signing;

pub use chain::{CertRole, CertificateChain, CertificateExt, SerialId};
