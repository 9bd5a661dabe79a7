//! Certificate renewal.
//!
//! A renewal never touches the active identity until a complete replacement
//! sits in the staging directory:
//!
//! 1. clear staging, generate a key pair and write it there;
//! 2. submit a CSR and write the returned chain and identity record to staging;
//! 3. move the active directory to the backup location, then promote staging
//!    (rolling back if the promotion fails);
//! 4. publish the new identity in memory and notify listeners.
//!
//! Any failure before step 3 leaves the active files untouched.

use super::{remove_dir_if_exists, ClientInner, CertificateClient, IdentitySnapshot};
use crate::cert::chain::{CertificateExt, SerialId};
use crate::crypto::ed25519::generate_ed25519_keypair;
use crate::error::{PkiError, Result};
use crate::storage::keystore::KeyFiles;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use x509_cert::certificate::Certificate;

/// Handle on a running renewal service.
pub(crate) struct RenewalTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl CertificateClient {
    /// Time left until `cert` enters the renewal grace window, zero once
    /// inside it.
    pub fn time_before_expiry_grace_period(&self, cert: &Certificate) -> Duration {
        let grace_start = cert
            .not_after()
            .checked_sub(self.inner.config.renewal_grace_period())
            .unwrap_or(UNIX_EPOCH);
        grace_start
            .duration_since(self.inner.clock.now())
            .unwrap_or(Duration::ZERO)
    }

    /// Replace the key pair and certificate.
    ///
    /// Without `force` nothing happens until the current certificate is inside
    /// its grace window; the current serial is returned in that case.
    pub async fn renew_and_store_key_and_certificate(&self, force: bool) -> Result<SerialId> {
        let _guard = self.inner.renewal_lock.lock().await;
        self.ensure_open()?;

        let current = self.identity();
        let old_serial = current.serial_id();
        if !force {
            let cert = current.certificate().ok_or_else(|| {
                PkiError::Initialization("no certificate to renew".to_string())
            })?;
            let remaining = self.time_before_expiry_grace_period(cert);
            if !remaining.is_zero() {
                debug!(component = %self.component_name(), remaining = ?remaining, "renewal not due");
                return Ok(cert.serial_id());
            }
        }

        let layout = &self.inner.layout;
        remove_dir_if_exists(&layout.staging_dir)?;
        let keypair = generate_ed25519_keypair()?;
        KeyFiles::in_dir(layout, &layout.staging_dir).write_keypair(&keypair)?;
        let chain = self.request_certificate(&keypair).await?;
        // Close may have started while waiting on the CA
        self.ensure_open()?;
        let new_serial = self.write_certificate(&layout.staging_dir, &chain)?;

        remove_dir_if_exists(&layout.backup_dir)?;
        if layout.identity_dir.exists() {
            fs::rename(&layout.identity_dir, &layout.backup_dir)?;
        }
        if let Err(e) = fs::rename(&layout.staging_dir, &layout.identity_dir) {
            error!(component = %self.component_name(), error = %e, "failed to promote renewed identity, rolling back");
            if layout.backup_dir.exists() {
                if let Err(rollback) = fs::rename(&layout.backup_dir, &layout.identity_dir) {
                    error!(component = %self.component_name(), error = %rollback, "rollback failed");
                }
            }
            return Err(e.into());
        }

        self.publish_identity(IdentitySnapshot {
            private_key: Some(keypair.secret.clone()),
            public_key: Some(keypair.public),
            chain: Some(chain),
        });
        info!(
            component = %self.component_name(),
            old_serial = ?old_serial,
            new_serial = %new_serial,
            "renewed certificate"
        );

        self.notify_listeners(old_serial.as_ref(), &new_serial);
        Ok(new_serial)
    }

    fn notify_listeners(&self, old_serial: Option<&SerialId>, new_serial: &SerialId) {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.notify_certificate_renewed(self.component_name(), old_serial, new_serial)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(component = %self.component_name(), error = %e, "renewal listener failed")
                }
                Err(_) => error!(component = %self.component_name(), "renewal listener panicked"),
            }
        }
    }

    /// Spawn the background renewal task on the current tokio runtime. A
    /// running service is left as is.
    pub fn start_renewal_service(&self) -> Result<()> {
        self.ensure_open()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PkiError::Service(format!("no tokio runtime: {}", e)))?;

        let mut slot = self
            .inner
            .renewal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Ok(());
        }

        let shutdown = Arc::new(Notify::new());
        let handle = runtime.spawn(renewal_loop(Arc::downgrade(&self.inner), shutdown.clone()));
        *slot = Some(RenewalTask { handle, shutdown });
        info!(component = %self.component_name(), "renewal service started");
        Ok(())
    }

    pub fn is_renewal_service_running(&self) -> bool {
        self.inner
            .renewal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the renewal service and wait for any renewal in flight.
    ///
    /// The service gets the configured shutdown timeout to finish, after which
    /// it is aborted. A certificate request in flight on any caller is
    /// cancelled, so this returns within twice the shutdown timeout.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.close_signal.notify_waiters();

        let task = self
            .inner
            .renewal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(RenewalTask { mut handle, shutdown }) = task {
            shutdown.notify_one();
            if tokio::time::timeout(self.shutdown_timeout(), &mut handle)
                .await
                .is_err()
            {
                warn!(component = %self.component_name(), "renewal service did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        // Cancelled requests release the lock promptly
        if tokio::time::timeout(self.shutdown_timeout(), self.inner.renewal_lock.lock())
            .await
            .is_err()
        {
            warn!(component = %self.component_name(), "renewal still in flight after shutdown timeout");
        }
        info!(component = %self.component_name(), "certificate client closed");
    }

    /// Delay before the renewal service looks again.
    fn next_check_delay(&self) -> Duration {
        let interval = self.inner.config.renewal_check_interval();
        match self.certificate() {
            Some(cert) => {
                let remaining = self.time_before_expiry_grace_period(&cert);
                if remaining.is_zero() {
                    interval
                } else {
                    remaining.min(interval)
                }
            }
            None => interval,
        }
    }

    fn renewal_due(&self) -> bool {
        self.certificate()
            .is_some_and(|cert| self.time_before_expiry_grace_period(&cert).is_zero())
    }

    fn report_failure(&self, failures: u32, error: &PkiError) {
        warn!(
            component = %self.component_name(),
            failures,
            error = %error,
            "certificate renewal failed"
        );
        if failures < self.inner.config.renewal_max_consecutive_failures {
            return;
        }
        let reporter = self
            .inner
            .health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match reporter {
            Some(reporter) => reporter.renewal_failing(self.component_name(), failures, error),
            None => error!(
                component = %self.component_name(),
                failures,
                "certificate renewal keeps failing"
            ),
        }
    }
}

async fn renewal_loop(inner: Weak<ClientInner>, shutdown: Arc<Notify>) {
    let mut failures = 0u32;
    loop {
        let Some(client) = upgrade(&inner) else { break };
        if client.renewal_due() {
            match client.renew_and_store_key_and_certificate(false).await {
                Ok(_) => failures = 0,
                Err(PkiError::Closed) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    client.report_failure(failures, &e);
                }
            }
        }
        let delay = client.next_check_delay();
        drop(client);

        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("renewal service stopped");
}

fn upgrade(inner: &Weak<ClientInner>) -> Option<CertificateClient> {
    let inner = inner.upgrade()?;
    if inner.closed.load(Ordering::SeqCst) {
        return None;
    }
    Some(CertificateClient { inner })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::ca::RevocationList;
    use crate::cert::chain::CertRole;
    use crate::client::notification::{CertificateNotification, HealthReporter};
    use crate::client::ClientCapabilities;
    use crate::net::service::{CertificateService, NodeDescriptor, SignedCertificateResponse};
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<(Option<SerialId>, SerialId)>>);

    impl CertificateNotification for Recorder {
        fn notify_certificate_renewed(
            &self,
            _component: &str,
            old_serial: Option<&SerialId>,
            new_serial: &SerialId,
        ) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((old_serial.cloned(), new_serial.clone()));
            Ok(())
        }
    }

    struct Panicking;

    impl CertificateNotification for Panicking {
        fn notify_certificate_renewed(
            &self,
            _component: &str,
            _old_serial: Option<&SerialId>,
            _new_serial: &SerialId,
        ) -> Result<()> {
            panic!("listener bug");
        }
    }

    struct Failing;

    impl CertificateNotification for Failing {
        fn notify_certificate_renewed(
            &self,
            _component: &str,
            _old_serial: Option<&SerialId>,
            _new_serial: &SerialId,
        ) -> Result<()> {
            Err(PkiError::Service("listener down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_grace_period_computation() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        let cert = client.certificate().unwrap();

        // 1 day certificate, 1 hour grace
        assert_eq!(
            client.time_before_expiry_grace_period(&cert),
            Duration::from_secs(23 * 3600)
        );
        fixture.clock.advance(Duration::from_secs(23 * 3600 + 1));
        assert_eq!(client.time_before_expiry_grace_period(&cert), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_renewal_not_due_keeps_identity() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        let serial = client.cert_serial_id().unwrap();

        assert_eq!(
            client.renew_and_store_key_and_certificate(false).await.unwrap(),
            serial
        );
        assert!(!client.layout().backup_dir.exists());
    }

    #[tokio::test]
    async fn test_forced_renewal_swaps_directories() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        let old_serial = client.cert_serial_id().unwrap();
        let old_public = client.public_key().unwrap();

        let new_serial = client.renew_and_store_key_and_certificate(true).await.unwrap();

        assert_ne!(new_serial, old_serial);
        assert_eq!(client.cert_serial_id().unwrap(), new_serial);
        assert_ne!(client.public_key().unwrap(), old_public);
        let layout = client.layout();
        assert!(!layout.staging_dir.exists());
        let backup = crate::client::read_chain(&layout.backup_dir, "certificate.crt")
            .unwrap()
            .unwrap();
        assert_eq!(backup.leaf().serial_id(), old_serial);
        assert_eq!(client.init().unwrap(), crate::client::InitState::Success);
    }

    #[tokio::test]
    async fn test_listeners_notified_in_order_despite_failures() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        let old_serial = client.cert_serial_id().unwrap();

        let first = Arc::new(Recorder(Mutex::new(Vec::new())));
        let last = Arc::new(Recorder(Mutex::new(Vec::new())));
        client.register_notification_receiver(first.clone());
        client.register_notification_receiver(Arc::new(Panicking));
        client.register_notification_receiver(Arc::new(Failing));
        client.register_notification_receiver(last.clone());

        let new_serial = client.renew_and_store_key_and_certificate(true).await.unwrap();

        let expected = vec![(Some(old_serial), new_serial)];
        assert_eq!(*first.0.lock().unwrap(), expected);
        assert_eq!(*last.0.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_renewal_after_close_is_rejected() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        client.close().await;

        match client.renew_and_store_key_and_certificate(true).await {
            Err(PkiError::Closed) => {}
            _ => panic!("Expected Closed"),
        }
        assert!(!client.layout().staging_dir.exists());
    }

    #[tokio::test]
    async fn test_renewal_service_renews_and_stops() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        client.ensure_initialized().await.unwrap();
        let old_serial = client.cert_serial_id().unwrap();

        client.start_renewal_service().unwrap();
        assert!(client.is_renewal_service_running());

        fixture.clock.advance(Duration::from_secs(23 * 3600 + 60));
        let mut renewed = false;
        for _ in 0..100 {
            if client.cert_serial_id().unwrap() != old_serial {
                renewed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(renewed);

        client.close().await;
        assert!(!client.is_renewal_service_running());
    }

    /// A CA that accepts a CSR and never answers.
    struct Unresponsive {
        submitted: Notify,
    }

    #[async_trait::async_trait]
    impl CertificateService for Unresponsive {
        async fn submit_csr(
            &self,
            _node: &NodeDescriptor,
            _csr_pem: &str,
        ) -> Result<SignedCertificateResponse> {
            self.submitted.notify_one();
            std::future::pending().await
        }

        async fn get_certificate(&self, serial: &SerialId) -> Result<String> {
            Err(PkiError::NotFound(serial.to_string()))
        }

        async fn list_certificates(
            &self,
            _role: CertRole,
            _start: Option<SerialId>,
            _count: usize,
        ) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_ca_certificates(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn all_root_ca_certificates(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn latest_crl(&self) -> Result<RevocationList> {
            Ok(RevocationList::new())
        }
    }

    #[tokio::test]
    async fn test_close_cancels_unanswered_certificate_request() {
        let fixture = Fixture::new();
        let service = Arc::new(Unresponsive {
            submitted: Notify::new(),
        });
        let client = CertificateClient::new(
            fixture.config.clone(),
            ClientCapabilities::new("dn", "CN=dn", NodeDescriptor::leaf("dn", "dn.cluster.local")),
            service.clone(),
            fixture.clock.clone(),
        )
        .unwrap();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.ensure_initialized().await }
        });
        service.submitted.notified().await;

        // shutdown timeout is 2s in the fixture
        tokio::time::timeout(Duration::from_secs(6), client.close())
            .await
            .expect("close should not wait on the CA");

        match pending.await.unwrap() {
            Err(PkiError::Closed) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(client.certificate().is_none());
        assert!(!client.layout().identity_dir.join("certificate.crt").exists());
    }

    struct CountingReporter(Mutex<Vec<u32>>);

    impl HealthReporter for CountingReporter {
        fn renewal_failing(&self, _component: &str, consecutive_failures: u32, _e: &PkiError) {
            self.0.lock().unwrap().push(consecutive_failures);
        }
    }

    #[test]
    fn test_failures_escalate_at_threshold() {
        let fixture = Fixture::new();
        let client = fixture.client("dn");
        let reporter = Arc::new(CountingReporter(Mutex::new(Vec::new())));
        client.set_health_reporter(reporter.clone());

        let max = client.config().renewal_max_consecutive_failures;
        let error = PkiError::Service("CA unavailable".to_string());
        for failures in 1..=max + 1 {
            client.report_failure(failures, &error);
        }

        assert_eq!(*reporter.0.lock().unwrap(), vec![max, max + 1]);
    }
}
