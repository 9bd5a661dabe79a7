//! Certificate revocation list.

use crate::cert::chain::SerialId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Why a certificate was revoked (RFC 5280 reason codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    PrivilegeWithdrawn,
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "key compromise",
            RevocationReason::CaCompromise => "CA compromise",
            RevocationReason::AffiliationChanged => "affiliation changed",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessation of operation",
            RevocationReason::CertificateHold => "certificate hold",
            RevocationReason::PrivilegeWithdrawn => "privilege withdrawn",
        };
        f.write_str(name)
    }
}

/// One revoked certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub serial: SerialId,
    pub reason: RevocationReason,
    /// Unix timestamp of the revocation.
    pub revoked_at: u64,
}

/// Revoked serials of one issuer. `crl_number` grows with every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationList {
    pub crl_number: u64,
    pub entries: Vec<RevokedEntry>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, serial: &SerialId) -> Option<&RevokedEntry> {
        self.entries.iter().find(|e| &e.serial == serial)
    }

    pub fn contains(&self, serial: &SerialId) -> bool {
        self.get(serial).is_some()
    }

    /// Record a revocation, returning the stored entry.
    ///
    /// Revoking an already revoked serial keeps the original entry and does
    /// not bump the CRL number.
    pub fn revoke(
        &mut self,
        serial: SerialId,
        reason: RevocationReason,
        at: SystemTime,
    ) -> RevokedEntry {
        if let Some(existing) = self.get(&serial) {
            return existing.clone();
        }
        let entry = RevokedEntry {
            serial,
            reason,
            revoked_at: at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        };
        self.entries.push(entry.clone());
        self.crl_number += 1;
        entry
    }

    pub fn serials(&self) -> impl Iterator<Item = &SerialId> {
        self.entries.iter().map(|e| &e.serial)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
