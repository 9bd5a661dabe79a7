//! Network-facing pieces: the CA service boundary and TLS key material.

pub mod config;
pub mod key_manager;
pub mod service;

pub use key_manager::{KeyDelegate, ReloadingKeyManager};
pub use service::{CertificateService, LocalCaService, NodeDescriptor, SignedCertificateResponse};
