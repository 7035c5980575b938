//! Caching of lookups, with concurrent lookups of a name sharing one query.

use super::{lock, Error, Lookup, Resolved};
use crate::name::ServiceName;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{runtime::Handle, sync::oneshot};

/// What a cache returns when refreshing an expired answer fails or comes
/// back empty.
///
/// An answer that has not expired is always served as is, without a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheFailurePolicy {
    /// Return the failure or empty answer, leaving any fallback to the
    /// retaining stage or to the caller.
    #[default]
    Propagate,
    /// Serve the expired answer, if there is one.
    ServeExpired,
}

#[derive(Debug)]
struct CacheEntry {
    resolved: Resolved,
    ttl: Duration,
    generation: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.resolved.fetched_at) < self.ttl
    }
}

type Refresh = Shared<BoxFuture<'static, Result<Resolved, Error>>>;

enum Pending {
    Cached(Resolved),
    Refresh(Refresh),
}

/// Per-name cache state.
#[derive(Default)]
struct Slot {
    entry: ArcSwapOption<CacheEntry>,
    /// The refresh currently running for this name, tagged with its
    /// generation.
    in_flight: Mutex<Option<(u64, Refresh)>>,
}

/// Clears a slot's in-flight marker when its refresh task finishes, panics
/// or is dropped with its runtime.
struct InFlightGuard {
    slot: Arc<Slot>,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.slot.in_flight);
        if matches!(&*in_flight, Some((generation, _)) if *generation == self.generation) {
            *in_flight = None;
        }
    }
}

/// Caches non-empty answers per name until their TTL runs out.
///
/// Refreshes run on their own task: one that every caller stopped waiting
/// for still completes and stores its answer, and later callers join it
/// instead of starting another query.
pub(crate) struct CachingLookup {
    inner: Arc<dyn Lookup>,
    slots: Mutex<HashMap<ServiceName, Arc<Slot>>>,
    generation: AtomicU64,
    max_ttl: Option<Duration>,
    policy: CacheFailurePolicy,
    runtime: Handle,
}

impl CachingLookup {
    pub(crate) fn new(
        inner: Arc<dyn Lookup>,
        max_ttl: Option<Duration>,
        policy: CacheFailurePolicy,
        runtime: Handle,
    ) -> Self {
        Self {
            inner,
            slots: Mutex::default(),
            generation: AtomicU64::new(0),
            max_ttl,
            policy,
            runtime,
        }
    }

    fn slot(&self, name: &ServiceName) -> Arc<Slot> {
        lock(&self.slots).entry(name.clone()).or_default().clone()
    }

    /// Forgets the answer for `name` and stops handing out the refresh
    /// running for it. That refresh still completes, but cannot replace an
    /// answer from a refresh started after it.
    pub(crate) fn invalidate(&self, name: &ServiceName) {
        if let Some(slot) = lock(&self.slots).get(name) {
            forget(slot);
        }
    }

    pub(crate) fn clear(&self) {
        for slot in lock(&self.slots).values() {
            forget(slot);
        }
    }

    /// Joins the refresh running for `slot`, or starts one, unless an answer
    /// became live in the meantime.
    fn refresh(&self, name: &ServiceName, slot: &Arc<Slot>) -> Pending {
        let mut in_flight = lock(&slot.in_flight);

        if let Some(entry) = slot.entry.load_full() {
            if entry.is_live(Instant::now()) {
                return Pending::Cached(entry.resolved.clone());
            }
        }
        if let Some((_, refresh)) = &*in_flight {
            #[cfg(feature = "log")]
            tracing::trace!(%name, "joining in-flight SRV refresh");
            return Pending::Refresh(refresh.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (outcome_tx, outcome_rx) = oneshot::channel::<Result<Resolved, Error>>();
        let refresh = outcome_rx
            .map(|received| {
                received
                    .unwrap_or_else(|_| Err(Error::Task("SRV refresh task was dropped".into())))
            })
            .boxed()
            .shared();
        *in_flight = Some((generation, refresh.clone()));
        // Spawning can drop the task on the spot, and its guard takes this lock.
        drop(in_flight);

        let guard = InFlightGuard {
            slot: slot.clone(),
            generation,
        };
        let inner = self.inner.clone();
        let name = name.clone();
        let max_ttl = self.max_ttl;
        let policy = self.policy;

        #[cfg(feature = "log")]
        tracing::debug!(%name, generation, "refreshing SRV cache entry");

        self.runtime.spawn(async move {
            let outcome = inner.lookup(&name).await;
            let outcome = store(&guard.slot, generation, outcome, max_ttl, policy);
            drop(guard);
            let _ = outcome_tx.send(outcome);
        });
        Pending::Refresh(refresh)
    }
}

fn forget(slot: &Slot) {
    let mut in_flight = lock(&slot.in_flight);
    slot.entry.store(None);
    *in_flight = None;
}

/// Applies the outcome of a refresh to a slot, returning what callers get.
fn store(
    slot: &Slot,
    generation: u64,
    outcome: Result<Resolved, Error>,
    max_ttl: Option<Duration>,
    policy: CacheFailurePolicy,
) -> Result<Resolved, Error> {
    match outcome {
        Ok(resolved) if !resolved.results.is_empty() => {
            let ttl = resolved
                .valid_until
                .saturating_duration_since(resolved.fetched_at);
            let ttl = max_ttl.map_or(ttl, |max| ttl.min(max));
            let entry = Arc::new(CacheEntry {
                resolved: resolved.clone(),
                ttl,
                generation,
            });
            // A newer refresh that already landed wins.
            slot.entry.rcu(|current| match current {
                Some(current) if current.generation > generation => Some(current.clone()),
                _ => Some(entry.clone()),
            });
            Ok(resolved)
        }
        outcome => match (policy, slot.entry.load_full()) {
            (CacheFailurePolicy::ServeExpired, Some(entry)) => {
                #[cfg(feature = "log")]
                tracing::debug!(
                    age = ?entry.resolved.fetched_at.elapsed(),
                    "SRV refresh failed or was empty, serving expired cache entry"
                );
                Ok(entry.resolved.clone())
            }
            _ => outcome,
        },
    }
}

#[async_trait]
impl Lookup for CachingLookup {
    async fn lookup(&self, name: &ServiceName) -> Result<Resolved, Error> {
        let slot = self.slot(name);
        if let Some(entry) = slot.entry.load_full() {
            if entry.is_live(Instant::now()) {
                #[cfg(feature = "log")]
                tracing::trace!(%name, "SRV cache hit");
                return Ok(entry.resolved.clone());
            }
        }

        match self.refresh(name, &slot) {
            Pending::Refresh(refresh) => refresh.await,
            Pending::Cached(resolved) => Ok(resolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::stub::{Calls, Step, Stub};
    use crate::client::timeout::TimeoutLookup;
    use crate::record::RawSrvRecord;
    use rand::{rngs::StdRng, SeedableRng};

    fn caching(
        steps: impl IntoIterator<Item = Step>,
        policy: CacheFailurePolicy,
    ) -> (Arc<CachingLookup>, Calls) {
        let stub = Stub::new(steps);
        let calls = stub.calls();
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(0)));
        let inner = Arc::new(TimeoutLookup::new(
            stub,
            Duration::from_millis(100),
            8,
            rng,
            Handle::current(),
        ));
        (
            Arc::new(CachingLookup::new(inner, None, policy, Handle::current())),
            calls,
        )
    }

    fn name() -> ServiceName {
        ServiceName::new("_svc._tcp.example.com").unwrap()
    }

    fn hosts(resolved: &Resolved) -> Vec<&str> {
        resolved.results.iter().map(|r| r.host.as_str()).collect()
    }

    fn records(host: &str) -> Vec<RawSrvRecord> {
        vec![RawSrvRecord::new(host, 443, 1, 1)]
    }

    #[tokio::test]
    async fn live_entry_is_served_without_query() {
        let (cache, calls) = caching([Step::Records(records("a."))], Default::default());
        cache.lookup(&name()).await.unwrap();
        let again = cache.lookup(&name()).await.unwrap();
        assert_eq!(hosts(&again), ["a."]);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_are_coalesced() {
        let slow = Step::Delay(Duration::from_millis(30), Box::new(Step::Records(records("a."))));
        let (cache, calls) = caching([slow], Default::default());
        let lookups = (0..20).map(|_| {
            let cache = cache.clone();
            async move { cache.lookup(&name()).await }
        });
        for outcome in futures::future::join_all(lookups).await {
            assert_eq!(hosts(&outcome.unwrap()), ["a."]);
        }
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refreshed() {
        let (cache, calls) = caching(
            [
                Step::RecordsWithTtl(records("a."), Duration::from_millis(20)),
                Step::Records(records("b.")),
            ],
            Default::default(),
        );
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["b."]);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_propagates_by_default() {
        let (cache, _) = caching(
            [
                Step::RecordsWithTtl(records("a."), Duration::ZERO),
                Step::Fail,
            ],
            CacheFailurePolicy::Propagate,
        );
        cache.lookup(&name()).await.unwrap();
        let err = cache.lookup(&name()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn failed_refresh_can_serve_expired_entry() {
        let (cache, calls) = caching(
            [
                Step::RecordsWithTtl(records("a."), Duration::ZERO),
                Step::Fail,
                Step::Empty,
            ],
            CacheFailurePolicy::ServeExpired,
        );
        cache.lookup(&name()).await.unwrap();
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn empty_answers_are_not_cached() {
        let (cache, calls) = caching([Step::Empty], Default::default());
        assert!(cache.lookup(&name()).await.unwrap().results.is_empty());
        assert!(cache.lookup(&name()).await.unwrap().results.is_empty());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn late_answer_is_not_cached() {
        let late = Step::Delay(Duration::from_millis(300), Box::new(Step::Records(records("late."))));
        let (cache, calls) = caching([late, Step::Records(records("b."))], Default::default());
        assert!(cache.lookup(&name()).await.unwrap_err().is_timeout());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["b."]);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn abandoned_refresh_is_joined_by_the_next_caller() {
        let slow = Step::Delay(Duration::from_millis(50), Box::new(Step::Records(records("a."))));
        let (cache, calls) = caching([slow, Step::Records(records("b."))], Default::default());
        let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.lookup(&name())).await;
        assert!(abandoned.is_err());
        assert!(lock(&cache.slot(&name()).in_flight).is_some());

        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        assert_eq!(calls.get(), 1);
        assert!(lock(&cache.slot(&name()).in_flight).is_none());
    }

    #[tokio::test]
    async fn abandoned_refresh_still_stores_its_answer() {
        let slow = Step::Delay(Duration::from_millis(30), Box::new(Step::Records(records("a."))));
        let (cache, calls) = caching([slow, Step::Records(records("b."))], Default::default());
        let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.lookup(&name())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lock(&cache.slot(&name()).in_flight).is_none());
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_releases_marker() {
        let (cache, calls) = caching([Step::Hang, Step::Records(records("a."))], Default::default());
        assert!(cache.lookup(&name()).await.unwrap_err().is_timeout());
        assert!(lock(&cache.slot(&name()).in_flight).is_none());

        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["a."]);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn refresh_from_before_invalidation_does_not_overwrite_newer_answer() {
        let slow = Step::Delay(Duration::from_millis(50), Box::new(Step::Records(records("old."))));
        let (cache, calls) = caching([slow, Step::Records(records("new."))], Default::default());
        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.lookup(&name()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.get(), 1);

        cache.invalidate(&name());
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["new."]);
        assert_eq!(hosts(&first.await.unwrap().unwrap()), ["old."]);

        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["new."]);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn max_ttl_caps_transport_ttl() {
        let stub = Stub::new([Step::Records(records("a.")), Step::Records(records("b."))]);
        let calls = stub.calls();
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(0)));
        let inner = Arc::new(TimeoutLookup::new(
            stub,
            Duration::from_millis(100),
            8,
            rng,
            Handle::current(),
        ));
        let cache = CachingLookup::new(
            inner,
            Some(Duration::from_millis(20)),
            CacheFailurePolicy::Propagate,
            Handle::current(),
        );
        cache.lookup(&name()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hosts(&cache.lookup(&name()).await.unwrap()), ["b."]);
        assert_eq!(calls.get(), 2);
    }
}
