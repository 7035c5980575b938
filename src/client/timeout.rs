//! Deadline-bounded lookups on a bounded set of spawned tasks.

use super::{lock, Error, Lookup, Resolved, SharedRng};
use crate::{name::ServiceName, resolver::order_records, resolver::SrvResolver};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::Semaphore, time::Instant};

/// Stands in for deadlines too far away for an [`Instant`] to hold.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Runs each query on its own task and gives up on it once its deadline passes.
///
/// The deadline covers waiting for a free query slot as well as the query
/// itself. The spawned task is bound by the same deadline, so a caller that
/// goes away does not leave a query running past it. Whatever a query
/// produces after its deadline is dropped with its task.
pub(crate) struct TimeoutLookup<R> {
    resolver: Arc<R>,
    timeout: Duration,
    permits: Arc<Semaphore>,
    rng: SharedRng,
    runtime: Handle,
}

impl<R> TimeoutLookup<R> {
    pub(crate) fn new(
        resolver: R,
        timeout: Duration,
        max_concurrent_queries: usize,
        rng: SharedRng,
        runtime: Handle,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            timeout,
            permits: Arc::new(Semaphore::new(
                max_concurrent_queries.min(Semaphore::MAX_PERMITS),
            )),
            rng,
            runtime,
        }
    }
}

#[async_trait]
impl<R: SrvResolver + 'static> Lookup for TimeoutLookup<R> {
    async fn lookup(&self, name: &ServiceName) -> Result<Resolved, Error> {
        let timeout = self.timeout;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        let resolver = self.resolver.clone();
        let permits = self.permits.clone();
        let rng = self.rng.clone();
        let srv = name.clone();
        let query = async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            let (records, valid_until) = resolver
                .get_srv_records_unordered(srv.as_str())
                .await
                .map_err(|e| Error::Transport(Arc::new(e)))?;
            let fetched_at = std::time::Instant::now();
            let results = order_records(records, &mut *lock(&rng));
            Ok(Resolved {
                results: Arc::new(results),
                fetched_at,
                valid_until,
            })
        };
        let task = self.runtime.spawn(async move {
            tokio::time::timeout_at(deadline, query)
                .await
                .unwrap_or(Err(Error::Timeout(timeout)))
        });

        let outcome = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(Error::Task(join_error.to_string())),
            Err(_) => Err(Error::Timeout(timeout)),
        };

        #[cfg(feature = "log")]
        match &outcome {
            Ok(resolved) => {
                tracing::trace!(%name, records = resolved.results.len(), "SRV lookup completed")
            }
            Err(e) => tracing::debug!(%name, error = %e, "SRV lookup failed"),
        }

        outcome
    }
}
