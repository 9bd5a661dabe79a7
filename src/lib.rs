//! cluster-pki: certificate lifecycle and trust management for cluster nodes
//!
//! This library gives every node of a storage cluster an Ed25519 X.509
//! identity for mutual TLS and message signing, and keeps it valid over time:
//!
//! - A certificate authority ([`ca::CertificateAuthority`]) that bootstraps a
//!   self-signed or imported root, runs subordinate CAs, signs CSRs under a
//!   pluggable profile and keeps a revocation list
//! - A per-component client ([`client::CertificateClient`]) that validates its
//!   key material at startup, obtains certificates and renews them before they
//!   expire without ever leaving the node without a usable identity
//! - A rustls key manager ([`net::ReloadingKeyManager`]) that switches new
//!   handshakes to renewed key material atomically
//! - A poller ([`client::RootCaRotationPoller`]) that distributes the current
//!   set of root certificates ahead of a root rotation
//!
//! # Architecture
//!
//! Shared state (identity, trust store, TLS key material) is held as immutable
//! snapshots behind `ArcSwap` and replaced wholesale, so readers never lock.
//! All operations return [`Result`] with a [`PkiError`]; nothing panics on
//! bad input.
//!
//! # Example
//!
//! ```rust,no_run
//! use cluster_pki::ca::CertificateAuthority;
//! use cluster_pki::client::{CertificateClient, ClientCapabilities};
//! use cluster_pki::clock::SystemClock;
//! use cluster_pki::config::SecurityConfig;
//! use cluster_pki::net::{LocalCaService, NodeDescriptor};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> cluster_pki::Result<()> {
//! let config = SecurityConfig::with_metadata_dir("/var/lib/cluster/pki");
//! let ca = CertificateAuthority::bootstrap_root(&config, "CN=Cluster Root CA")?;
//! let service = Arc::new(LocalCaService::new(Arc::new(ca), Duration::from_secs(86400)));
//!
//! let caps = ClientCapabilities::new(
//!     "datanode",
//!     "CN=datanode-1",
//!     NodeDescriptor::leaf("datanode-1", "dn1.cluster.local"),
//! );
//! let client = CertificateClient::new(config, caps, service, Arc::new(SystemClock))?;
//! client.ensure_initialized().await?;
//! client.start_renewal_service()?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod cert;
pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod storage;

// Re-export commonly used types
pub use cert::chain::{CertRole, CertificateChain, CertificateExt, SerialId};
pub use error::{PkiError, Result};
