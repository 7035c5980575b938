//! SRV records.

use std::{cmp::Reverse, fmt::Display};

use rand::Rng;

/// Representation of types that contain the fields of a SRV record.
pub trait SrvRecord {
    /// Type representing the SRV record's target. Must implement `Display` so
    /// it can be turned into a [`LookupResult`] host.
    type Target: Display + ?Sized;

    /// Gets a SRV record's target.
    fn target(&self) -> &Self::Target;

    /// Gets a SRV record's port.
    fn port(&self) -> u16;

    /// Gets a SRV record's priority.
    fn priority(&self) -> u16;

    /// Gets a SRV record's weight.
    fn weight(&self) -> u16;

    /// Converts a SRV record into the endpoint handed back to callers.
    fn to_lookup_result(&self) -> LookupResult {
        LookupResult {
            host: self.target().to_string(),
            port: self.port(),
            priority: self.priority(),
            weight: self.weight(),
        }
    }

    /// Generates a key to sort a SRV record by priority and weight per RFC 2782.
    fn sort_key(&self, rng: impl Rng) -> (u16, Reverse<u64>) {
        sort_key(self.priority(), self.weight(), rng)
    }
}

/// Generates a key to sort a SRV record by priority and weight per RFC 2782.
///
/// Sorting a tier by this key yields a weighted random permutation: each
/// record draws `u^(1/w)` for a uniform `u`, and larger draws come first.
/// A weight of zero is treated as one so such records are still picked.
pub(crate) fn sort_key(priority: u16, weight: u16, mut rng: impl Rng) -> (u16, Reverse<u64>) {
    let weight = f64::from(weight.max(1));
    let draw = rng.random::<f64>().powf(weight.recip());
    // Non-negative floats order the same way as their bit patterns.
    (priority, Reverse(draw.to_bits()))
}

/// A plain SRV record, for transports that do not have their own record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawSrvRecord {
    /// Target host name.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Priority; lower is preferred.
    pub priority: u16,
    /// Relative weight among records of the same priority.
    pub weight: u16,
}

impl RawSrvRecord {
    /// Creates a record.
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }
}

impl SrvRecord for RawSrvRecord {
    type Target = str;

    fn target(&self) -> &Self::Target {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn weight(&self) -> u16 {
        self.weight
    }
}

/// One resolved endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupResult {
    /// Host name of the endpoint.
    pub host: String,
    /// Port of the endpoint.
    pub port: u16,
    /// Priority; lower is preferred.
    pub priority: u16,
    /// Relative weight among endpoints of the same priority.
    pub weight: u16,
}

impl From<RawSrvRecord> for LookupResult {
    fn from(record: RawSrvRecord) -> Self {
        Self {
            host: record.host,
            port: record.port,
            priority: record.priority,
            weight: record.weight,
        }
    }
}
