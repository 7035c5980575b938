//! Falling back to the last good answer when a lookup fails.

use super::{lock, Error, Lookup, Resolved};
use crate::name::ServiceName;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Remembers the last non-empty answer for each name and serves it in place
/// of failures and empty answers.
///
/// The age of a remembered answer counts from when the transport returned
/// it, so serving it again from a cache does not make it any younger.
pub(crate) struct RetainingLookup {
    inner: Arc<dyn Lookup>,
    last_good: Mutex<HashMap<ServiceName, Resolved>>,
    retention: Option<Duration>,
}

impl RetainingLookup {
    pub(crate) fn new(inner: Arc<dyn Lookup>, retention: Option<Duration>) -> Self {
        Self {
            inner,
            last_good: Mutex::default(),
            retention,
        }
    }

    fn retained(&self, name: &ServiceName) -> Option<Resolved> {
        let last_good = lock(&self.last_good).get(name).cloned()?;
        match self.retention {
            Some(retention) if last_good.fetched_at.elapsed() >= retention => None,
            _ => Some(last_good),
        }
    }

    fn remember(&self, name: &ServiceName, resolved: &Resolved) {
        let mut last_good = lock(&self.last_good);
        match last_good.get(name) {
            // Lookups finishing out of order keep the newer answer.
            Some(kept) if kept.fetched_at >= resolved.fetched_at => {}
            _ => {
                last_good.insert(name.clone(), resolved.clone());
            }
        }
    }
}

#[async_trait]
impl Lookup for RetainingLookup {
    async fn lookup(&self, name: &ServiceName) -> Result<Resolved, Error> {
        match self.inner.lookup(name).await {
            Ok(resolved) if !resolved.results.is_empty() => {
                self.remember(name, &resolved);
                Ok(resolved)
            }
            outcome => match self.retained(name) {
                Some(last_good) => {
                    #[cfg(feature = "log")]
                    match &outcome {
                        Ok(_) => tracing::debug!(%name, "SRV lookup was empty, serving retained answer"),
                        Err(e) => tracing::debug!(%name, error = %e, "SRV lookup failed, serving retained answer"),
                    }
                    Ok(last_good)
                }
                None => outcome,
            },
        }
    }
}
