//! Startup evaluation of a component's key material.
//!
//! [`CertificateClient::init`] inspects the identity directory and decides
//! what the component must do before it can serve:
//!
//! | private | public | certificate | outcome |
//! |---------|--------|-------------|---------|
//! | no      | no     | no          | new key pair, [`InitState::GetCert`]; [`InitState::Recover`] when an interrupted renewal left material in staging or backup |
//! | no      | any    | any         | [`InitState::Failure`] |
//! | yes     | no     | no          | [`InitState::Failure`] |
//! | yes     | no     | yes         | public key recovered, [`InitState::Success`] |
//! | yes     | yes    | no          | [`InitState::Recover`] |
//! | yes     | yes    | yes         | [`InitState::Success`], [`InitState::Reinit`] when expired |
//!
//! [`CertificateClient::ensure_initialized`] then acts on the outcome.

use super::{load_snapshot, read_chain, remove_dir_if_exists, CertificateClient, IdentitySnapshot};
use crate::cert::chain::{CertificateChain, CertificateExt, SerialId};
use crate::cert::codec;
use crate::cert::csr::build_csr;
use crate::config::IdentityLayout;
use crate::crypto::ed25519::{generate_ed25519_keypair, Keypair};
use crate::error::{PkiError, Result};
use crate::storage::cert_storage::CertificateStorage;
use crate::storage::keystore::KeyFiles;
use crate::storage::metadata::IdentityRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Outcome of evaluating a component's identity at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitState {
    /// Key pair and certificate are present, consistent and current.
    Success,
    /// The material on disk is inconsistent; operator action is needed.
    Failure,
    /// No material at all; a fresh key pair awaits its first certificate.
    GetCert,
    /// Usable keys exist but a certificate must be obtained or restored.
    Recover,
    /// The certificate expired; start over with new keys.
    Reinit,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::Success => "SUCCESS",
            InitState::Failure => "FAILURE",
            InitState::GetCert => "GETCERT",
            InitState::Recover => "RECOVER",
            InitState::Reinit => "REINIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InitOutcome {
    pub(crate) state: Option<InitState>,
    pub(crate) detail: Option<String>,
    /// Directory holding the consistent material to restore.
    pub(crate) restore_from: Option<PathBuf>,
}

// Corrupt key or certificate files make init fail; I/O errors are fatal.
macro_rules! load_or_fail {
    ($client:expr, $read:expr, $what:literal) => {
        match $read {
            Ok(value) => value,
            Err(e @ PkiError::Io(_)) => return Err(e),
            Err(e) => {
                return Ok($client.finish_init(
                    InitState::Failure,
                    Some(format!(concat!($what, " is unreadable: {}"), e)),
                    None,
                ))
            }
        }
    };
}

impl CertificateClient {
    /// Evaluate the identity directory and return the resulting state.
    ///
    /// Only I/O failures are returned as errors; every other problem yields
    /// [`InitState::Failure`] with its detail available from
    /// [`CertificateClient::last_init_detail`].
    pub fn init(&self) -> Result<InitState> {
        let layout = &self.inner.layout;
        let dir = &layout.identity_dir;
        let keys = KeyFiles::in_dir(layout, dir);

        let private_key = load_or_fail!(self, keys.read_private_key(), "private key");
        let public_key = load_or_fail!(self, keys.read_public_key(), "public key");
        let chain = load_or_fail!(
            self,
            read_chain(dir, &layout.certificate_file_name),
            "certificate"
        );

        let state = match (private_key, public_key, chain) {
            (None, None, None) => {
                // A renewal interrupted between its two renames leaves the
                // material in staging or backup only
                if let Some(source) = interrupted_swap_source(layout, self.inner.clock.now()) {
                    return Ok(self.finish_init(
                        InitState::Recover,
                        Some(format!(
                            "identity missing, restoring from {}",
                            source.display()
                        )),
                        Some(source),
                    ));
                }
                let keypair = generate_ed25519_keypair()?;
                keys.write_keypair(&keypair)?;
                self.publish_keys(&keypair, None);
                info!(component = %self.component_name(), "generated key pair for a new identity");
                self.finish_init(InitState::GetCert, None, None)
            }
            (None, _, _) => self.finish_init(
                InitState::Failure,
                Some("private key not found".to_string()),
                None,
            ),
            (Some(_), None, None) => self.finish_init(
                InitState::Failure,
                Some("public key and certificate not found".to_string()),
                None,
            ),
            (Some(secret), None, Some(chain)) => {
                match chain
                    .leaf()
                    .public_key()
                    .and_then(|public| Keypair::from_parts(secret, public))
                {
                    Ok(keypair) => {
                        keys.write_public_key(&keypair.public)?;
                        self.publish_keys(&keypair, Some(chain));
                        info!(component = %self.component_name(), "recovered public key from certificate");
                        self.finish_init(InitState::Success, None, None)
                    }
                    Err(_) => self.finish_init(
                        InitState::Failure,
                        Some("Can't recover public key".to_string()),
                        None,
                    ),
                }
            }
            (Some(secret), Some(public), None) => match Keypair::from_parts(secret, public) {
                Ok(keypair) => {
                    self.publish_keys(&keypair, None);
                    self.finish_init(
                        InitState::Recover,
                        Some("certificate not found".to_string()),
                        None,
                    )
                }
                Err(_) => self.finish_init(
                    InitState::Failure,
                    Some("Keypair validation failed".to_string()),
                    None,
                ),
            },
            (Some(secret), Some(public), Some(chain)) => {
                let Ok(keypair) = Keypair::from_parts(secret, public) else {
                    return Ok(self.finish_init(
                        InitState::Failure,
                        Some("Keypair validation failed".to_string()),
                        None,
                    ));
                };
                let leaf = chain.leaf();
                if leaf.public_key().ok() != Some(keypair.public) {
                    if holds_consistent_identity(layout, &layout.backup_dir) {
                        self.finish_init(
                            InitState::Recover,
                            Some("stored certificate does not match the key pair, restoring backup".to_string()),
                            Some(layout.backup_dir.clone()),
                        )
                    } else {
                        self.finish_init(
                            InitState::Failure,
                            Some("Keypair validation failed: stored certificate is generated with different private key".to_string()),
                            None,
                        )
                    }
                } else if self.inner.clock.now() >= leaf.not_after() {
                    self.finish_init(
                        InitState::Reinit,
                        Some(format!("certificate {} has expired", leaf.serial_id())),
                        None,
                    )
                } else {
                    self.publish_keys(&keypair, Some(chain));
                    self.finish_init(InitState::Success, None, None)
                }
            }
        };
        Ok(state)
    }

    /// Detail recorded by the last [`CertificateClient::init`] call.
    pub fn last_init_detail(&self) -> Option<String> {
        self.init_outcome().detail
    }

    /// State produced by the last [`CertificateClient::init`] call.
    pub fn last_init_state(&self) -> Option<InitState> {
        self.init_outcome().state
    }

    /// Run [`CertificateClient::init`] and act on its outcome, leaving the
    /// component with a usable identity or an `Initialization` error.
    pub async fn ensure_initialized(&self) -> Result<InitState> {
        let _guard = self.inner.renewal_lock.lock().await;
        self.ensure_open()?;

        let state = self.init()?;
        match state {
            InitState::Success => {}
            InitState::GetCert => self.bootstrap_certificate().await?,
            InitState::Recover => match self.init_outcome().restore_from {
                Some(source) => self.restore_identity(&source)?,
                None => self.bootstrap_certificate().await?,
            },
            InitState::Reinit => self.reinitialize().await?,
            InitState::Failure => {
                let detail = self
                    .last_init_detail()
                    .unwrap_or_else(|| "identity validation failed".to_string());
                error!(component = %self.component_name(), detail = %detail, "initialization failed");
                return Err(PkiError::Initialization(detail));
            }
        }
        Ok(state)
    }

    /// Submit a CSR for `keypair` and return the issued chain. Issuers that
    /// come with the reply are added to the trust store.
    pub(crate) async fn request_certificate(&self, keypair: &Keypair) -> Result<CertificateChain> {
        let caps = &self.inner.caps;
        let csr = build_csr(
            keypair,
            &caps.subject,
            caps.descriptor.role,
            &caps.alt_names,
        )?;
        let response = self
            .until_closed(self.inner.service.submit_csr(&caps.descriptor, &csr))
            .await?;

        let chain = codec::decode(&response.leaf_chain_pem)?;
        if chain.leaf().public_key()? != keypair.public {
            return Err(PkiError::KeypairMismatch(format!(
                "certificate {} returned for {} does not carry the requested key",
                chain.leaf().serial_id(),
                caps.component_name
            )));
        }
        chain.validate_links()?;
        self.trust_received_chain(&chain, response.root_chain_pem.as_deref())?;
        debug!(component = %caps.component_name, serial = %chain.leaf().serial_id(), "received certificate");
        Ok(chain)
    }

    /// Write a certificate chain and its identity record into `dir`.
    pub(crate) fn write_certificate(&self, dir: &Path, chain: &CertificateChain) -> Result<SerialId> {
        let layout = &self.inner.layout;
        let serial = chain.leaf().serial_id();
        CertificateStorage::new(dir).write_chain(&layout.certificate_file_name, chain)?;
        IdentityRecord::new(
            self.component_name().to_string(),
            serial.clone(),
            self.inner.clock.now(),
        )
        .save(&layout.record_path(dir))?;
        Ok(serial)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PkiError::Closed);
        }
        Ok(())
    }

    /// Drive `call` to completion unless the client is closed first.
    pub(crate) async fn until_closed<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let closed = self.inner.close_signal.notified();
        tokio::pin!(closed);
        // Register before checking the flag so a close in between is not missed
        closed.as_mut().enable();
        self.ensure_open()?;

        tokio::select! {
            _ = &mut closed => {
                debug!(component = %self.component_name(), "certificate request cancelled by close");
                Err(PkiError::Closed)
            }
            result = call => result,
        }
    }

    async fn bootstrap_certificate(&self) -> Result<()> {
        let identity = self.identity();
        let keypair = identity.keypair().ok_or_else(|| {
            PkiError::Initialization("no key pair available to request a certificate".to_string())
        })?;
        let chain = self.request_certificate(&keypair).await?;
        self.ensure_open()?;
        let serial = self.write_certificate(&self.inner.layout.identity_dir, &chain)?;
        self.publish_keys(&keypair, Some(chain));
        info!(component = %self.component_name(), serial = %serial, "obtained certificate");
        Ok(())
    }

    /// Copy the key pair, certificate and record from `source` into the
    /// identity directory. A restored staging directory is consumed.
    fn restore_identity(&self, source: &Path) -> Result<()> {
        let layout = &self.inner.layout;
        fs::create_dir_all(&layout.identity_dir)?;
        let names = [
            layout.private_key_file_name.as_str(),
            layout.public_key_file_name.as_str(),
            layout.certificate_file_name.as_str(),
        ];
        for name in names {
            fs::copy(source.join(name), layout.identity_dir.join(name))?;
        }
        let record = layout.record_path(source);
        if record.is_file() {
            fs::copy(&record, layout.record_path(&layout.identity_dir))?;
        }
        if source == layout.staging_dir {
            remove_dir_if_exists(&layout.staging_dir)?;
        }

        let snapshot = load_snapshot(layout, &layout.identity_dir);
        let serial = snapshot.serial_id();
        self.publish_identity(snapshot);
        warn!(
            component = %self.component_name(),
            serial = ?serial,
            source = %source.display(),
            "restored identity"
        );
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        let layout = &self.inner.layout;
        remove_dir_if_exists(&layout.backup_dir)?;
        fs::rename(&layout.identity_dir, &layout.backup_dir)?;
        info!(component = %self.component_name(), "moved expired identity to backup");

        let keypair = generate_ed25519_keypair()?;
        KeyFiles::in_dir(layout, &layout.identity_dir).write_keypair(&keypair)?;
        self.publish_keys(&keypair, None);
        self.bootstrap_certificate().await
    }

    fn publish_keys(&self, keypair: &Keypair, chain: Option<CertificateChain>) {
        self.publish_identity(IdentitySnapshot {
            private_key: Some(keypair.secret.clone()),
            public_key: Some(keypair.public),
            chain,
        });
    }

    fn finish_init(
        &self,
        state: InitState,
        detail: Option<String>,
        restore_from: Option<PathBuf>,
    ) -> InitState {
        match (&state, &detail) {
            (InitState::Failure, Some(d)) => {
                warn!(component = %self.component_name(), state = %state, detail = %d, "identity check")
            }
            (_, Some(d)) => {
                info!(component = %self.component_name(), state = %state, detail = %d, "identity check")
            }
            (_, None) => info!(component = %self.component_name(), state = %state, "identity check"),
        }
        let mut outcome = self
            .inner
            .init_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *outcome = InitOutcome {
            state: Some(state),
            detail,
            restore_from,
        };
        state
    }

    fn init_outcome(&self) -> InitOutcome {
        self.inner
            .init_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Where a half-finished renewal left usable material: the staged identity
/// when complete, else the previous one if it has not expired.
fn interrupted_swap_source(layout: &IdentityLayout, now: SystemTime) -> Option<PathBuf> {
    [&layout.staging_dir, &layout.backup_dir]
        .into_iter()
        .find(|dir| {
            holds_consistent_identity(layout, dir)
                && load_snapshot(layout, dir)
                    .certificate()
                    .is_some_and(|cert| now < cert.not_after())
        })
        .cloned()
}

/// Whether `dir` holds a key pair and a certificate for that key pair.
fn holds_consistent_identity(layout: &IdentityLayout, dir: &Path) -> bool {
    let snapshot = load_snapshot(layout, dir);
    match (snapshot.keypair(), snapshot.certificate()) {
        (Some(keypair), Some(cert)) => cert.public_key().ok() == Some(keypair.public),
        _ => false,
    }
}
