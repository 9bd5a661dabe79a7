//! Key file storage.
//!
//! A component keeps its private key as a PKCS#8 PEM file and its public key
//! as an SPKI PEM file next to its certificate. Both are written with
//! owner-only permissions.

use crate::config::IdentityLayout;
use crate::crypto::ed25519::{
    private_key_from_pem, private_key_to_pem, public_key_from_pem, public_key_to_pem, Keypair,
};
use crate::error::Result;
use crate::storage::cert_storage::write_restricted;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// The key files of one identity directory.
#[derive(Debug, Clone)]
pub struct KeyFiles {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

impl KeyFiles {
    pub fn new(private_key_path: PathBuf, public_key_path: PathBuf) -> Self {
        Self {
            private_key_path,
            public_key_path,
        }
    }

    /// Key files of `dir` named according to `layout`.
    pub fn in_dir(layout: &IdentityLayout, dir: &Path) -> Self {
        Self::new(layout.private_key_path(dir), layout.public_key_path(dir))
    }

    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }

    /// Load the private key, `None` if the file does not exist.
    pub fn read_private_key(&self) -> Result<Option<SigningKey>> {
        read_optional(&self.private_key_path)?
            .map(|pem| private_key_from_pem(&pem))
            .transpose()
    }

    /// Load the public key, `None` if the file does not exist.
    pub fn read_public_key(&self) -> Result<Option<VerifyingKey>> {
        read_optional(&self.public_key_path)?
            .map(|pem| public_key_from_pem(&pem))
            .transpose()
    }

    pub fn write_private_key(&self, secret: &SigningKey) -> Result<()> {
        write_restricted(&self.private_key_path, &private_key_to_pem(secret)?)
    }

    pub fn write_public_key(&self, public: &VerifyingKey) -> Result<()> {
        write_restricted(&self.public_key_path, &public_key_to_pem(public)?)
    }

    /// Persist both halves of `keypair`.
    pub fn write_keypair(&self, keypair: &Keypair) -> Result<()> {
        self.write_private_key(&keypair.secret)?;
        self.write_public_key(&keypair.public)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
