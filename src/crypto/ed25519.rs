//! Ed25519 key operations.
//!
//! This module provides key pair generation, signing, verification and the
//! PKCS#8 / SPKI encodings used for key files and TLS key material.

use crate::error::{PkiError, Result};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// PEM label of a PKCS#8 private key.
pub const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
/// PEM label of an SPKI public key.
pub const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// An Ed25519 keypair consisting of a secret key and public key.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub secret: SigningKey,
    pub public: VerifyingKey,
}

impl Keypair {
    /// Create a new keypair from a signing key.
    pub fn from_secret(secret: SigningKey) -> Self {
        let public = secret.verifying_key();
        Self { secret, public }
    }

    /// Assemble a keypair from independently stored halves.
    ///
    /// Fails with `KeypairMismatch` when the public key was not derived from
    /// the secret key.
    pub fn from_parts(secret: SigningKey, public: VerifyingKey) -> Result<Self> {
        if secret.verifying_key() != public {
            return Err(PkiError::KeypairMismatch(
                "public key does not belong to the private key".to_string(),
            ));
        }
        Ok(Self { secret, public })
    }

    /// Get the public key as bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Get the secret key as bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.secret.sign(message)
    }

    /// Verify a signature.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.public
            .verify(message, signature)
            .map_err(|e| PkiError::Crypto(format!("Signature verification failed: {}", e)))
    }

    /// Sign and verify a probe message to prove both halves work together.
    pub fn validate(&self) -> bool {
        let probe = b"cluster-pki keypair validation";
        self.secret.verifying_key() == self.public && self.verify(probe, &self.sign(probe)).is_ok()
    }
}

/// Generate a new Ed25519 keypair using a cryptographically secure random number generator.
///
/// # Example
///
/// ```
/// use cluster_pki::crypto::ed25519::generate_ed25519_keypair;
///
/// let keypair = generate_ed25519_keypair().unwrap();
/// assert_eq!(keypair.public_bytes().len(), 32);
/// ```
pub fn generate_ed25519_keypair() -> Result<Keypair> {
    let secret = SigningKey::generate(&mut OsRng);
    Ok(Keypair::from_secret(secret))
}

/// Import an Ed25519 keypair from a 32-byte secret key.
pub fn import_ed25519_from_bytes(bytes: &[u8]) -> Result<Keypair> {
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        PkiError::InvalidKey(format!(
            "Expected 32 bytes for Ed25519 secret key, got {}",
            bytes.len()
        ))
    })?;
    Ok(Keypair::from_secret(SigningKey::from_bytes(&key_bytes)))
}

/// Build a verifying key from a raw 32-byte public key.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        PkiError::InvalidKey(format!(
            "Expected 32 bytes for Ed25519 public key, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| PkiError::InvalidKey(format!("Invalid Ed25519 public key: {}", e)))
}

/// Encode a signing key as PKCS#8 DER.
pub fn private_key_to_pkcs8_der(secret: &SigningKey) -> Result<Vec<u8>> {
    let document = secret
        .to_pkcs8_der()
        .map_err(|e| PkiError::InvalidKey(format!("Failed to encode private key: {}", e)))?;
    Ok(document.as_bytes().to_vec())
}

/// Encode a signing key as a PKCS#8 PEM document.
pub fn private_key_to_pem(secret: &SigningKey) -> Result<String> {
    let der = private_key_to_pkcs8_der(secret)?;
    Ok(pem::encode_config(
        &pem::Pem::new(PRIVATE_KEY_TAG, der),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}

/// Decode a PKCS#8 PEM private key.
///
/// Both version 1 and version 2 (embedded public key) documents are accepted.
pub fn private_key_from_pem(pem_str: &str) -> Result<SigningKey> {
    let block = pem::parse(pem_str)
        .map_err(|e| PkiError::InvalidKey(format!("Failed to parse private key PEM: {}", e)))?;
    if block.tag() != PRIVATE_KEY_TAG {
        return Err(PkiError::InvalidKey(format!(
            "Expected {}, got {}",
            PRIVATE_KEY_TAG,
            block.tag()
        )));
    }
    SigningKey::from_pkcs8_der(block.contents())
        .map_err(|e| PkiError::InvalidKey(format!("Failed to decode private key: {}", e)))
}

/// Encode a verifying key as an SPKI PEM document.
pub fn public_key_to_pem(public: &VerifyingKey) -> Result<String> {
    let document = public
        .to_public_key_der()
        .map_err(|e| PkiError::InvalidKey(format!("Failed to encode public key: {}", e)))?;
    Ok(pem::encode_config(
        &pem::Pem::new(PUBLIC_KEY_TAG, document.as_bytes().to_vec()),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    ))
}

/// Decode an SPKI PEM public key.
pub fn public_key_from_pem(pem_str: &str) -> Result<VerifyingKey> {
    let block = pem::parse(pem_str)
        .map_err(|e| PkiError::InvalidKey(format!("Failed to parse public key PEM: {}", e)))?;
    if block.tag() != PUBLIC_KEY_TAG {
        return Err(PkiError::InvalidKey(format!(
            "Expected {}, got {}",
            PUBLIC_KEY_TAG,
            block.tag()
        )));
    }
    VerifyingKey::from_public_key_der(block.contents())
        .map_err(|e| PkiError::InvalidKey(format!("Failed to decode public key: {}", e)))
}

/// Verify `signature` over `data` with `public`, never failing.
pub fn verify_signature(public: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => public.verify(data, &sig).is_ok(),
        Err(_) => false,
    }
}
