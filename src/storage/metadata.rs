//! Identity record.
//!
//! A small JSON document stored beside a component's key material that
//! remembers which certificate serial is current. It is rewritten inside the
//! staging directory during renewal, so it moves atomically with the keys.

use crate::cert::chain::SerialId;
use crate::error::{PkiError, Result};
use crate::storage::cert_storage::write_restricted;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Persisted identity state of one component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityRecord {
    /// The component this identity belongs to.
    pub component: String,

    /// Serial of the active certificate.
    pub cert_serial_id: SerialId,

    /// Timestamp of the last update (Unix timestamp).
    pub updated_at: u64,
}

impl IdentityRecord {
    pub fn new(component: String, cert_serial_id: SerialId, now: SystemTime) -> Self {
        Self {
            component,
            cert_serial_id,
            updated_at: now
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Read the record at `path`, `None` if absent.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PkiError::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_restricted(path, &json)
    }
}
