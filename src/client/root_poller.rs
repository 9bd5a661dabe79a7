//! Root CA rotation polling.
//!
//! The poller fetches the complete set of current root certificates on a
//! fixed interval and hands that set to every consumer. Consumers see the
//! full set on every tick and decide for themselves what is new.

use crate::cert::codec;
use crate::error::{PkiError, Result};
use crate::net::service::CertificateService;
use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use x509_cert::certificate::Certificate;

/// Where the authoritative set of root certificates comes from.
#[async_trait]
pub trait RootCaSource: Send + Sync {
    async fn fetch_root_certificates(&self) -> Result<Vec<Certificate>>;
}

/// Reads the root set from a [`CertificateService`].
pub struct ServiceRootCaSource {
    service: Arc<dyn CertificateService>,
}

impl ServiceRootCaSource {
    pub fn new(service: Arc<dyn CertificateService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RootCaSource for ServiceRootCaSource {
    async fn fetch_root_certificates(&self) -> Result<Vec<Certificate>> {
        self.service
            .all_root_ca_certificates()
            .await?
            .iter()
            .map(|pem| codec::decode_certificate(pem))
            .collect()
    }
}

type RootCaConsumer = Box<dyn Fn(&[Certificate]) + Send + Sync>;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically fetches the root set and fans it out to consumers.
pub struct RootCaRotationPoller {
    source: Arc<dyn RootCaSource>,
    interval: Duration,
    shutdown_timeout: Duration,
    consumers: Arc<RwLock<Vec<RootCaConsumer>>>,
    task: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl RootCaRotationPoller {
    pub fn new(source: Arc<dyn RootCaSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            consumers: Arc::new(RwLock::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register a consumer; it is called with the full root set on every
    /// successful tick.
    pub fn add_consumer<F>(&self, consumer: F)
    where
        F: Fn(&[Certificate]) + Send + Sync + 'static,
    {
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(consumer));
    }

    /// Fetch once and notify consumers, returning the number of roots.
    pub async fn poll_once(&self) -> Result<usize> {
        poll(self.source.as_ref(), &self.consumers).await
    }

    /// Start polling on the current tokio runtime. The first tick runs
    /// immediately.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PkiError::Service(format!("no tokio runtime: {}", e)))?;
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            return Ok(());
        }

        let shutdown = Arc::new(Notify::new());
        let source = self.source.clone();
        let consumers = self.consumers.clone();
        let interval = self.interval;
        let stop = shutdown.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {}
                }
                match poll(source.as_ref(), &consumers).await {
                    Ok(count) => debug!(roots = count, "polled root CA certificates"),
                    Err(e) => warn!(error = %e, "failed to fetch root CA certificates"),
                }
            }
            debug!("root CA poller stopped");
        });
        *slot = Some((handle, shutdown));
        info!(interval = ?self.interval, "root CA poller started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// Stop polling, letting an in-flight tick finish within the shutdown
    /// timeout before aborting it.
    pub async fn close(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((mut handle, shutdown)) = task else {
            return;
        };
        shutdown.notify_one();
        if tokio::time::timeout(self.shutdown_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!("root CA poller did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn poll(source: &dyn RootCaSource, consumers: &RwLock<Vec<RootCaConsumer>>) -> Result<usize> {
    let roots = source.fetch_root_certificates().await?;
    let consumers = consumers.read().unwrap_or_else(|e| e.into_inner());
    for consumer in consumers.iter() {
        if catch_unwind(AssertUnwindSafe(|| consumer(&roots))).is_err() {
            error!("root CA consumer panicked");
        }
    }
    Ok(roots.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::chain::{CertificateExt, SerialId};
    use crate::cert::x509_signing::create_root_certificate;
    use crate::crypto::ed25519::generate_ed25519_keypair;
    use std::collections::VecDeque;
    use std::time::SystemTime;

    struct ScriptedSource(Mutex<VecDeque<Vec<Certificate>>>);

    #[async_trait]
    impl RootCaSource for ScriptedSource {
        async fn fetch_root_certificates(&self) -> Result<Vec<Certificate>> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| PkiError::Service("no more roots".to_string()))
        }
    }

    fn root(serial: u64) -> Certificate {
        let keypair = generate_ed25519_keypair().unwrap();
        let now = SystemTime::now();
        create_root_certificate(
            &keypair,
            "CN=Root",
            SerialId::from(serial),
            now,
            now + Duration::from_secs(86400),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_consumers_receive_full_sets() {
        let a = root(1);
        let b = root(2);
        let source = Arc::new(ScriptedSource(Mutex::new(VecDeque::from(vec![
            vec![a.clone()],
            vec![a.clone(), b.clone()],
        ]))));
        let poller = RootCaRotationPoller::new(source, Duration::from_millis(20));

        let seen: Arc<Mutex<Vec<Vec<SerialId>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        poller.add_consumer(move |roots| {
            sink.lock()
                .unwrap()
                .push(roots.iter().map(|r| r.serial_id()).collect());
        });

        poller.start().unwrap();
        assert!(poller.is_running());
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        poller.close().await;
        assert!(!poller.is_running());

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                vec![SerialId::from(1u64)],
                vec![SerialId::from(1u64), SerialId::from(2u64)],
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_errors_skip_tick() {
        let source = Arc::new(ScriptedSource(Mutex::new(VecDeque::new())));
        let poller = RootCaRotationPoller::new(source, Duration::from_secs(60));
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        poller.add_consumer(move |_| *counter.lock().unwrap() += 1);

        assert!(poller.poll_once().await.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_consumer_does_not_stop_others() {
        let source = Arc::new(ScriptedSource(Mutex::new(VecDeque::from(vec![vec![
            root(7),
        ]]))));
        let poller = RootCaRotationPoller::new(source, Duration::from_secs(60));
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        poller.add_consumer(|_| panic!("consumer bug"));
        poller.add_consumer(move |_| *counter.lock().unwrap() += 1);

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let source = Arc::new(ScriptedSource(Mutex::new(VecDeque::new())));
        let poller = RootCaRotationPoller::new(source, Duration::from_secs(60));
        poller.close().await;
        assert!(!poller.is_running());
    }
}
