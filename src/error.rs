//! Error types for the cluster PKI library.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`PkiError`]. Variants carry a human readable message so that callers and
//! logs see actionable detail without having to downcast.

use thiserror::Error;

/// The main error type for certificate lifecycle operations.
#[derive(Error, Debug)]
pub enum PkiError {
    /// A certificate could not be serialized to DER/PEM
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Malformed PEM, wrong block type, bad DER, or no certificates at all
    #[error("Decode error: {0}")]
    Decode(String),

    /// A requested file, serial, or certificate does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A request or certificate violates the issuing policy
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Public key, private key and certificate do not belong together
    #[error("Keypair mismatch: {0}")]
    KeypairMismatch(String),

    /// Filesystem I/O error
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid key format or content
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Signing was requested but could not be performed
    #[error("Error while signing: {0}")]
    Signing(String),

    /// Certificate generation or validation error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The certificate authority or client could not be brought up
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// The remote certificate service failed
    #[error("Service error: {0}")]
    Service(String),

    /// The component has been closed
    #[error("Certificate client is closed")]
    Closed,
}

/// A specialized Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PkiError::Decode("no certificates".to_string());
        assert_eq!(err.to_string(), "Decode error: no certificates");

        let err = PkiError::Signing("no private key".to_string());
        assert!(err.to_string().contains("Error while signing"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PkiError>();
    }

    #[test]
    fn test_io_error_conversion() {
        fn read_missing() -> Result<Vec<u8>> {
            Ok(std::fs::read("/definitely/not/here/cert.crt")?)
        }

        match read_missing() {
            Err(PkiError::Io(_)) => {}
            _ => panic!("Expected Io error"),
        }
    }
}
