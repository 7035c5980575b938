#![deny(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

/*!
Asynchronous resolution of services located by DNS SRV records.

# Introduction

SRV Records, as defined in [RFC 2782](https://tools.ietf.org/html/rfc2782),
are DNS records of the form

`_Service._Proto.Name TTL Class SRV Priority Weight Port Target`

For instance, a DNS server might respond with the following SRV records for
`_http._tcp.example.com`:

```text
_http._tcp.example.com. 60 IN SRV 1 100 443 test1.example.com.
_http._tcp.example.com. 60 IN SRV 2 50  443 test2.example.com.
_http._tcp.example.com. 60 IN SRV 2 50  443 test3.example.com.
```

A client wanting to communicate with this example service would first try to
communicate with `test1.example.com:443` (the record with the lowest
priority), then with the other two (in a random order weighted by their
weights, since they are of the same priority) should the first be unavailable.

`srv-resolve` turns a service name into that ordered list of endpoints. A
[`DnsSrvResolver`] is built once (and should be reused to take advantage of
caching) from a [`SrvResolver`] transport and a handful of policies:

- every DNS query runs on its own task under a deadline, so a slow or
  unresponsive nameserver never holds a caller past
  [`Builder::dns_lookup_timeout`];
- answers are cached for their TTL, and concurrent lookups of the same name
  share a single query ([`Builder::caching_lookups`]);
- when a lookup fails or comes back empty, the last non-empty answer for the
  name is served instead ([`Builder::retaining_data_on_failures`]).

An empty answer is returned as an empty list, never as an error; callers are
expected to check for it.

[`SrvWatcher`] builds on a resolver to poll a name and notify subscribers
when its endpoints change.

# Resolver Backends

Any type implementing [`SrvResolver`] can serve as the DNS transport. The
provided backends are enabled by the following features:

- `hickory` (via [`hickory_resolver::Resolver`])

[`SrvResolver`]: resolver::SrvResolver
[`SrvWatcher`]: client::watcher::SrvWatcher
*/

pub mod client;
pub use client::{Builder, CacheFailurePolicy, ConfigError, DnsSrvResolver, Error};

mod name;
pub use name::{NameError, ServiceName};

mod record;
pub use record::{LookupResult, RawSrvRecord, SrvRecord};

pub mod resolver;
