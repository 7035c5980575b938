//! Watching a service's endpoints for changes.

use super::{ConfigError, DnsSrvResolver};
use crate::{name::ServiceName, record::LookupResult};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// Endpoints of a watched service, as published to subscribers.
pub type Endpoints = Arc<Vec<LookupResult>>;

/// Periodically resolves a service name and publishes its endpoints whenever
/// the set of endpoints changes.
///
/// Subscribers are only notified when the set differs from the one last
/// published; a reshuffle of equally prioritized endpoints is not a change.
/// Lookup errors leave the published endpoints as they were.
#[derive(Debug)]
pub struct SrvWatcher {
    handle: Option<JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
    watch_rx: watch::Receiver<Endpoints>,
}

impl SrvWatcher {
    /// Starts polling `name` through `resolver` every `interval`, beginning
    /// immediately.
    pub fn new(
        resolver: DnsSrvResolver,
        name: ServiceName,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        let (watch_tx, watch_rx) = watch::channel(Endpoints::default());
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let runtime = resolver.runtime().clone();
        let worker = Worker {
            resolver,
            name,
            interval,
            watch_tx,
        };
        let handle = runtime.spawn(worker.run(terminate_rx));

        Ok(Self {
            handle: Some(handle),
            terminate_tx: Some(terminate_tx),
            watch_rx,
        })
    }

    /// Returns a receiver notified on every change of endpoints.
    pub fn subscribe(&self) -> watch::Receiver<Endpoints> {
        self.watch_rx.clone()
    }

    /// Returns the endpoints most recently published.
    pub fn current(&self) -> Endpoints {
        self.watch_rx.borrow().clone()
    }

    /// Stops polling and waits for the polling task to finish.
    pub async fn terminate(mut self) {
        if let Some(terminate_tx) = self.terminate_tx.take() {
            let _ = terminate_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SrvWatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Worker {
    resolver: DnsSrvResolver,
    name: ServiceName,
    interval: Duration,
    watch_tx: watch::Sender<Endpoints>,
}

impl Worker {
    async fn run(self, mut terminate_rx: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut terminate_rx => return,
                _ = interval.tick() => self.poll().await,
            }
        }
    }

    async fn poll(&self) {
        let results = match self.resolver.resolve_name(&self.name).await {
            Ok(results) => results,
            Err(e) => {
                #[cfg(feature = "log")]
                tracing::debug!(name = %self.name, error = %e, "SRV watch lookup failed");
                return;
            }
        };

        let changed = self.watch_tx.send_if_modified(|current| {
            if same_endpoints(current.as_slice(), &results) {
                return false;
            }
            *current = Arc::new(results);
            true
        });
        if changed {
            #[cfg(feature = "log")]
            tracing::info!(
                name = %self.name,
                endpoints = self.watch_tx.borrow().len(),
                "SRV endpoints changed"
            );
        }
    }
}

fn same_endpoints(a: &[LookupResult], b: &[LookupResult]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
