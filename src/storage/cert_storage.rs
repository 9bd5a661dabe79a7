//! Filesystem persistence of certificates.
//!
//! Every file written here is restricted to its owner (mode `0o700`). Trust
//! directories name files by role and serial (`ROOTCA-<serial>.crt`,
//! `CA-<serial>.crt`, `<serial>.crt`) so a scan can classify them without
//! decoding first.

use crate::cert::chain::{CertRole, CertificateChain, CertificateExt};
use crate::cert::codec;
use crate::error::{PkiError, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Permission bits applied to every stored key or certificate file.
pub const FILE_MODE: u32 = 0o700;

/// Write `contents` to `path`, creating parent directories and restricting
/// permissions to the owner.
pub fn write_restricted(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = open_owner_only(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    // A file that already existed keeps its old mode through open
    set_owner_only(path)?;
    debug!(path = %path.display(), "wrote file");
    Ok(())
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

/// Certificate persistence rooted at a directory.
#[derive(Debug, Clone)]
pub struct CertificateStorage {
    dir: PathBuf,
}

impl CertificateStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encode `chain` and write it as `file_name`.
    pub fn write_chain(&self, file_name: &str, chain: &CertificateChain) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        write_restricted(&path, &codec::encode(chain)?)?;
        Ok(path)
    }

    /// Write an already encoded PEM document as `file_name`.
    pub fn write_pem(&self, file_name: &str, pem: &str) -> Result<PathBuf> {
        let path = self.dir.join(file_name);
        write_restricted(&path, pem)?;
        Ok(path)
    }

    /// Store `pem` under the role-prefixed name of its first certificate.
    ///
    /// The declared role must agree with what the certificate is: a root must
    /// be self-signed, a subordinate must be a CA that is not self-signed and
    /// a leaf must not be a CA.
    pub fn write_with_role(&self, pem: &str, role: CertRole) -> Result<CertificateChain> {
        let chain = codec::decode(pem)?;
        let leaf = chain.leaf();
        let actual = leaf.role();
        if actual != role {
            return Err(PkiError::PolicyViolation(format!(
                "certificate {} is a {} certificate, cannot store it as {}",
                leaf.serial_id(),
                actual,
                role
            )));
        }
        let file_name = role.file_name(&leaf.serial_id());
        self.write_pem(&file_name, pem)?;
        Ok(chain)
    }

    /// Read and decode `file_name`.
    pub fn read_chain(&self, file_name: &str) -> Result<CertificateChain> {
        let path = self.dir.join(file_name);
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                PkiError::NotFound(format!("certificate file {}", path.display()))
            }
            _ => PkiError::Io(e),
        })?;
        codec::decode(&contents)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.dir.join(file_name).is_file()
    }

    /// Load every role-named certificate in the directory.
    ///
    /// Files whose name does not follow the naming scheme are ignored; files
    /// whose content contradicts their prefix, or that fail to decode, are
    /// logged and skipped.
    pub fn load_all(&self) -> Result<Vec<(CertRole, CertificateChain)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(role) = CertRole::from_file_name(&name) else {
                continue;
            };
            match self.read_chain(&name) {
                Ok(chain) if chain.leaf().role() == role => loaded.push((role, chain)),
                Ok(chain) => warn!(
                    file = %name,
                    expected = %role,
                    actual = %chain.leaf().role(),
                    "skipping certificate whose content contradicts its file name"
                ),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable certificate"),
            }
        }
        loaded.sort_by(|(_, a), (_, b)| a.leaf().serial_id().cmp(&b.leaf().serial_id()));
        Ok(loaded)
    }

    /// Remove `file_name` if present.
    pub fn remove(&self, file_name: &str) -> Result<()> {
        match fs::remove_file(self.dir.join(file_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::x509_signing::{create_self_signed_ca, issue_certificate};
    use crate::crypto::ed25519::generate_ed25519_keypair;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn root_and_leaf_pem() -> (String, String) {
        let root_keypair = generate_ed25519_keypair().unwrap();
        let root = create_self_signed_ca(&root_keypair, "CN=Root", SystemTime::now(), 365).unwrap();
        let leaf_keypair = generate_ed25519_keypair().unwrap();
        let leaf = issue_certificate(
            &leaf_keypair.public,
            "CN=node",
            &root_keypair,
            &root,
            false,
            SystemTime::now(),
            30,
        )
        .unwrap();
        (
            codec::encode_certificate(&root).unwrap(),
            codec::encode_certificate(&leaf).unwrap(),
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_written_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/cert.crt");
        write_restricted(&path, "data").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_MODE);
    }

    #[cfg(unix)]
    #[test]
    fn test_overwrite_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("private.pem");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_restricted(&path, "new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_MODE);
    }

    #[test]
    fn test_write_with_role_uses_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path());
        let (root_pem, leaf_pem) = root_and_leaf_pem();

        let root = storage.write_with_role(&root_pem, CertRole::Root).unwrap();
        let leaf = storage.write_with_role(&leaf_pem, CertRole::Leaf).unwrap();

        let root_file = format!("ROOTCA-{}.crt", root.leaf().serial_id());
        let leaf_file = format!("{}.crt", leaf.leaf().serial_id());
        assert!(storage.exists(&root_file));
        assert!(storage.exists(&leaf_file));
        assert_eq!(storage.read_chain(&root_file).unwrap(), root);
    }

    #[test]
    fn test_role_must_match_content() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path());
        let (root_pem, leaf_pem) = root_and_leaf_pem();

        match storage.write_with_role(&leaf_pem, CertRole::Root) {
            Err(PkiError::PolicyViolation(_)) => {}
            _ => panic!("Expected PolicyViolation"),
        }
        assert!(storage
            .write_with_role(&root_pem, CertRole::Subordinate)
            .is_err());
        assert!(storage.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path());

        match storage.read_chain("absent.crt") {
            Err(PkiError::NotFound(_)) => {}
            _ => panic!("Expected NotFound"),
        }

        storage.write_pem("corrupt.crt", "not a certificate").unwrap();
        match storage.read_chain("corrupt.crt") {
            Err(PkiError::Decode(_)) => {}
            _ => panic!("Expected Decode error"),
        }
    }

    #[test]
    fn test_load_all_skips_mislabelled_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path());
        let (root_pem, leaf_pem) = root_and_leaf_pem();

        storage.write_with_role(&root_pem, CertRole::Root).unwrap();
        // A leaf masquerading as a root
        storage.write_pem("ROOTCA-999.crt", &leaf_pem).unwrap();
        storage.write_pem("notes.txt", "ignored").unwrap();

        let loaded = storage.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, CertRole::Root);
    }

    #[test]
    fn test_load_all_on_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path().join("nope"));
        assert!(storage.load_all().unwrap().is_empty());
    }
}
