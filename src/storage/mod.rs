//! Persistence of keys, certificates and trust material.

pub mod cert_storage;
pub mod keystore;
pub mod metadata;
pub mod trusted;

pub use cert_storage::CertificateStorage;
pub use trusted::{TrustStore, TrustedCertStorage};
