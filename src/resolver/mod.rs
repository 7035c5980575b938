//! SRV resolvers.

use crate::record::{LookupResult, SrvRecord};
use async_trait::async_trait;
use rand::Rng;
use std::time::Instant;

#[cfg(feature = "hickory")]
pub mod hickory;

/// Represents the ability to act as a SRV resolver.
///
/// This is the DNS transport the lookup pipeline is built on: one query per
/// call, with no caching or retrying of its own.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// SRV record representation produced by the resolver.
    type Record: SrvRecord + Send;

    /// Errors encountered during SRV resolution.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Gets the records corresponding to a srv name without sorting by priority
    /// or shuffling based on weight, along with the time they are valid until.
    ///
    /// A well-formed answer without records is `Ok` with an empty list.
    async fn get_srv_records_unordered(
        &self,
        srv: &str,
    ) -> Result<(Vec<Self::Record>, Instant), Self::Error>;

    /// Sorts SRV records by priority and weight per RFC 2782.
    fn order_srv_records(records: &mut [Self::Record], mut rng: impl Rng) {
        records.sort_by_cached_key(|record| record.sort_key(&mut rng));
    }
}

/// Orders SRV records by priority and weight and converts them into
/// [`LookupResult`]s.
pub fn order_records<R: SrvRecord>(mut records: Vec<R>, mut rng: impl Rng) -> Vec<LookupResult> {
    records.sort_by_cached_key(|record| record.sort_key(&mut rng));
    records.iter().map(SrvRecord::to_lookup_result).collect()
}
