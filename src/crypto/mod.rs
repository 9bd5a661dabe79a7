//! Cryptographic operations module.
//!
//! Node identities use Ed25519 exclusively. Key files are PKCS#8 (private)
//! and SPKI (public) PEM documents.
//!
//! # Example
//!
//! ```rust
//! use cluster_pki::crypto::ed25519::{generate_ed25519_keypair, private_key_from_pem, private_key_to_pem};
//!
//! # fn example() -> cluster_pki::error::Result<()> {
//! let keypair = generate_ed25519_keypair()?;
//! let pem = private_key_to_pem(&keypair.secret)?;
//! let restored = private_key_from_pem(&pem)?;
//! assert_eq!(restored.verifying_key(), keypair.public);
//! # Ok(())
//! # }
//! ```

pub mod ed25519;
