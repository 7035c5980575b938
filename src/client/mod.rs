//! Resolution of SRV names through a stack of lookup policies.

use crate::{
    name::{NameError, ServiceName},
    record::LookupResult,
    resolver::SrvResolver,
};
use async_trait::async_trait;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::runtime::Handle;

mod cache;
pub use cache::CacheFailurePolicy;
use cache::CachingLookup;

mod retain;
use retain::RetainingLookup;

mod timeout;
use timeout::TimeoutLookup;

pub mod watcher;

#[cfg(test)]
pub(crate) mod stub;

/// Default deadline for a single DNS lookup.
pub const DEFAULT_DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of DNS queries allowed to run at the same time.
pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 64;

/// Errors encountered by a [`DnsSrvResolver`].
///
/// An answer without records is not an error: it is returned as an empty list.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The lookup did not complete before its deadline.
    #[error("SRV lookup timed out after {0:?}")]
    Timeout(Duration),
    /// The DNS transport failed.
    #[error("SRV lookup error: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
    /// The task running the lookup panicked or was cancelled.
    #[error("SRV lookup task failed: {0}")]
    Task(String),
    /// The name given to the resolver could not be parsed.
    #[error("invalid service name: {0}")]
    InvalidName(#[from] NameError),
}

impl Error {
    /// Returns `true` if the lookup hit its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors produced when building a [`DnsSrvResolver`] from inconsistent settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The DNS lookup timeout was zero.
    #[error("DNS lookup timeout must be positive")]
    ZeroTimeout,
    /// The maximum number of concurrent queries was zero.
    #[error("at least one concurrent DNS query must be allowed")]
    ZeroConcurrency,
    /// The maximum cache TTL was zero.
    #[error("maximum cache TTL must be positive")]
    ZeroCacheTtl,
    /// The retention period was zero.
    #[error("retention period must be positive")]
    ZeroRetention,
    /// A watcher polling interval was zero.
    #[error("polling interval must be positive")]
    ZeroInterval,
    /// No runtime was given and none was running.
    #[error("no tokio runtime available to run lookups on")]
    NoRuntime,
}

/// Random source shared by every lookup of a resolver.
pub(crate) type SharedRng = Arc<Mutex<dyn RngCore + Send>>;

/// Ordered results of a lookup, along with when they were fetched from the
/// transport and the time they are valid until.
///
/// Stages that hand out a stored answer keep its `fetched_at`, so it always
/// tells the age of the answer rather than of the call that returned it.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub(crate) results: Arc<Vec<LookupResult>>,
    pub(crate) fetched_at: Instant,
    pub(crate) valid_until: Instant,
}

/// One stage of the lookup pipeline.
#[async_trait]
pub(crate) trait Lookup: Send + Sync {
    async fn lookup(&self, name: &ServiceName) -> Result<Resolved, Error>;
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolver for services located by SRV records.
///
/// # Usage
///
/// A resolver is created with [`DnsSrvResolver::builder`], which wraps a
/// [`SrvResolver`] transport with the configured policies:
///
/// - every query runs on a spawned task and is abandoned when its deadline
///   passes ([`Builder::dns_lookup_timeout`]);
/// - answers are cached until their TTL expires, and concurrent lookups of
///   one name share a single query ([`Builder::caching_lookups`]);
/// - failed or empty lookups fall back to the last non-empty answer seen for
///   the name ([`Builder::retaining_data_on_failures`]).
///
/// Resolvers are cheap to clone; clones share caches.
#[derive(Clone)]
pub struct DnsSrvResolver {
    chain: Arc<dyn Lookup>,
    cache: Option<Arc<CachingLookup>>,
    runtime: Handle,
}

impl fmt::Debug for DnsSrvResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsSrvResolver")
            .field("caching", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl DnsSrvResolver {
    /// Starts configuring a resolver that queries DNS through `resolver`.
    pub fn builder<R: SrvResolver + 'static>(resolver: R) -> Builder<R> {
        Builder::new(resolver)
    }

    /// Resolves `name` to its endpoints, ordered by priority and then
    /// randomly by weight.
    pub async fn resolve(&self, name: &str) -> Result<Vec<LookupResult>, Error> {
        let name = ServiceName::new(name)?;
        self.resolve_name(&name).await
    }

    /// Resolves an already parsed service name.
    pub async fn resolve_name(&self, name: &ServiceName) -> Result<Vec<LookupResult>, Error> {
        let resolved = self.chain.lookup(name).await?;
        Ok(Arc::unwrap_or_clone(resolved.results))
    }

    /// Drops the cached answer for `name`, if caching is enabled. The next
    /// lookup of `name` queries DNS again instead of joining a query that was
    /// already running.
    pub fn invalidate(&self, name: &ServiceName) {
        if let Some(cache) = &self.cache {
            cache.invalidate(name);
        }
    }

    /// Drops every cached answer, if caching is enabled.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

/// Builder for [`DnsSrvResolver`]s.
pub struct Builder<R> {
    resolver: R,
    caching_lookups: bool,
    retaining_data_on_failures: bool,
    dns_lookup_timeout: Duration,
    retention: Option<Duration>,
    max_cache_ttl: Option<Duration>,
    cache_failure_policy: CacheFailurePolicy,
    max_concurrent_queries: usize,
    rng: Option<SharedRng>,
    runtime: Option<Handle>,
}

impl<R: SrvResolver + 'static> Builder<R> {
    /// Creates a builder with caching and retention enabled and a five
    /// second lookup timeout.
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            caching_lookups: true,
            retaining_data_on_failures: true,
            dns_lookup_timeout: DEFAULT_DNS_LOOKUP_TIMEOUT,
            retention: None,
            max_cache_ttl: None,
            cache_failure_policy: CacheFailurePolicy::default(),
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
            rng: None,
            runtime: None,
        }
    }

    /// Sets whether answers are cached for their TTL.
    pub fn caching_lookups(self, caching_lookups: bool) -> Self {
        Self {
            caching_lookups,
            ..self
        }
    }

    /// Sets whether the last non-empty answer for a name is served when a
    /// later lookup fails or comes back empty.
    pub fn retaining_data_on_failures(self, retaining_data_on_failures: bool) -> Self {
        Self {
            retaining_data_on_failures,
            ..self
        }
    }

    /// Sets the deadline for a single DNS lookup. Deadlines too far in the
    /// future to represent are treated as never expiring.
    pub fn dns_lookup_timeout(self, dns_lookup_timeout: Duration) -> Self {
        Self {
            dns_lookup_timeout,
            ..self
        }
    }

    /// Sets the deadline for a single DNS lookup, in milliseconds.
    pub fn dns_lookup_timeout_millis(self, millis: u64) -> Self {
        self.dns_lookup_timeout(Duration::from_millis(millis))
    }

    /// Sets how long a retained answer may be served after it was obtained.
    /// Retained answers never expire unless this is set.
    pub fn retention(self, retention: Duration) -> Self {
        Self {
            retention: Some(retention),
            ..self
        }
    }

    /// Caps how long answers are cached, regardless of their DNS TTL.
    pub fn max_cache_ttl(self, max_cache_ttl: Duration) -> Self {
        Self {
            max_cache_ttl: Some(max_cache_ttl),
            ..self
        }
    }

    /// Sets what the cache returns when refreshing an expired answer fails.
    pub fn cache_failure_policy(self, cache_failure_policy: CacheFailurePolicy) -> Self {
        Self {
            cache_failure_policy,
            ..self
        }
    }

    /// Sets how many DNS queries may run at the same time.
    pub fn max_concurrent_queries(self, max_concurrent_queries: usize) -> Self {
        Self {
            max_concurrent_queries,
            ..self
        }
    }

    /// Sets the random source used to order records of equal priority.
    pub fn rng(self, rng: impl RngCore + Send + 'static) -> Self {
        let rng: SharedRng = Arc::new(Mutex::new(rng));
        Self {
            rng: Some(rng),
            ..self
        }
    }

    /// Sets the runtime lookups are spawned on. Defaults to the runtime
    /// [`Builder::build`] is called from.
    pub fn runtime(self, runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..self
        }
    }

    /// Assembles the lookup pipeline.
    pub fn build(self) -> Result<DnsSrvResolver, ConfigError> {
        if self.dns_lookup_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::ZeroCacheTtl);
        }
        if self.retention.is_some_and(|retention| retention.is_zero()) {
            return Err(ConfigError::ZeroRetention);
        }
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ConfigError::NoRuntime)?,
        };
        let rng = self
            .rng
            .unwrap_or_else(|| Arc::new(Mutex::new(StdRng::from_os_rng())));

        let mut chain: Arc<dyn Lookup> = Arc::new(TimeoutLookup::new(
            self.resolver,
            self.dns_lookup_timeout,
            self.max_concurrent_queries,
            rng,
            runtime.clone(),
        ));

        let cache = if self.caching_lookups {
            let cache = Arc::new(CachingLookup::new(
                chain,
                self.max_cache_ttl,
                self.cache_failure_policy,
                runtime.clone(),
            ));
            chain = cache.clone();
            Some(cache)
        } else {
            None
        };

        if self.retaining_data_on_failures {
            chain = Arc::new(RetainingLookup::new(chain, self.retention));
        }

        #[cfg(feature = "log")]
        tracing::debug!(
            caching = self.caching_lookups,
            retaining = self.retaining_data_on_failures,
            timeout = ?self.dns_lookup_timeout,
            "built SRV resolver"
        );

        Ok(DnsSrvResolver {
            chain,
            cache,
            runtime,
        })
    }
}
