//! Configuration types accepted when constructing a [`Client`](crate::client::Client).
//!
//! `ClientOptions` uses the [`typed-builder`](https://crates.io/crates/typed-builder) crate to
//! derive a type-safe builder, mirroring the rest of this crate's option structs. For example:
//!
//! ```rust
//! use fleet_rpc::options::{ClientOptions, DiscoveryMode};
//!
//! let options = ClientOptions::builder()
//!     .discovery(DiscoveryMode::Direct {
//!         hosts: vec!["10.0.0.1:2020".parse().unwrap()],
//!     })
//!     .target(4)
//!     .maximum(8)
//!     .build();
//! ```

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{Error, ErrorKind, Result};

const DEFAULT_TARGET: u32 = 3;
const DEFAULT_MAXIMUM: u32 = 5;
const DEFAULT_FALLBACK_MAX_MS: u64 = 15_000;
const DEFAULT_KEEPALIVE_IDLE_MS: u64 = 10_000;
const DEFAULT_DEFAULT_PORT: u16 = 2020;

/// A retry/backoff policy for a single kind of operation (TCP connect, A lookup, SRV lookup).
///
/// Mirrors the `recovery.default.*` / `recovery.dns.*` / `recovery.dns_srv.*` option groups.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RecoveryPolicy {
    /// Number of retries after the first attempt. `0` disables retrying entirely, which is how
    /// direct-IP mode suppresses SRV lookups (`recovery.dns_srv.retries = 0`).
    #[builder(default = 3)]
    pub retries: u32,

    /// Timeout for a single attempt.
    #[builder(default = Duration::from_secs(2))]
    pub timeout: Duration,

    /// Upper bound on a single attempt's timeout once backoff has grown it.
    #[builder(default = Duration::from_secs(8))]
    pub max_timeout: Duration,

    /// Initial delay before the first retry.
    #[builder(default = Duration::from_millis(100))]
    pub delay: Duration,

    /// Upper bound on the delay between retries.
    #[builder(default = Duration::from_secs(4))]
    pub max_delay: Duration,
}

impl RecoveryPolicy {
    /// The zero-retry, short-timeout policy used by default for SRV lookups so that direct-IP
    /// mode (a sentinel, non-existent `service` label) fails the SRV probe almost immediately
    /// rather than eating into startup time.
    fn disabled() -> Self {
        Self::builder()
            .retries(0)
            .timeout(Duration::from_millis(200))
            .build()
    }
}

/// Which discovery mode the resolver uses to produce backends.
#[derive(Clone, Debug)]
pub enum DiscoveryMode {
    /// One or more fixed `host:port` pairs; re-resolved on a timer if `host` is a DNS name.
    Direct { hosts: Vec<std::net::SocketAddr> },

    /// A `_service._proto.domain` SRV name; each target is further resolved to an address.
    Srv {
        service: String,
        default_port: u16,
    },
}

/// Top-level configuration accepted by [`Client::init`](crate::client::Client::init).
#[derive(Clone, Debug, TypedBuilder)]
pub struct ClientOptions {
    /// How backends are discovered.
    pub discovery: DiscoveryMode,

    /// Desired number of steady-state connections.
    #[builder(default = DEFAULT_TARGET)]
    pub target: u32,

    /// Hard ceiling on connections across all backends.
    #[builder(default = DEFAULT_MAXIMUM)]
    pub maximum: u32,

    /// Retry/backoff policy for TCP connect attempts.
    #[builder(default = RecoveryPolicy::builder().build())]
    pub recovery_default: RecoveryPolicy,

    /// Retry/backoff policy for A-record lookups.
    #[builder(default = RecoveryPolicy::builder().build())]
    pub recovery_dns: RecoveryPolicy,

    /// Retry/backoff policy for SRV-record lookups. Defaults to a disabled (zero-retry) policy;
    /// set explicitly when running in SRV mode against a flaky resolver.
    #[builder(default = RecoveryPolicy::disabled())]
    pub recovery_dns_srv: RecoveryPolicy,

    /// Explicit DNS resolver addresses; falls back to the system configuration when empty.
    #[builder(default)]
    pub resolvers: Vec<std::net::SocketAddr>,

    /// Bound on outstanding DNS queries.
    #[builder(default = 10)]
    pub max_dns_concurrency: u32,

    /// If `true`, `Client::init` surfaces a fatal error if the initial connection attempt fails
    /// before the connection set reaches `running`.
    #[builder(default = false)]
    pub fail_fast: bool,

    /// If `true`, transport errors are unwrapped to their root cause before being surfaced to
    /// callers.
    #[builder(default = false)]
    pub unwrap_errors: bool,

    /// Bounded window (see [`DEFAULT_FALLBACK_MAX_MS`]) for which the pool keeps serving
    /// requests off a connection whose backend has been removed, absorbing brief discovery
    /// flaps.
    #[builder(default = Duration::from_millis(DEFAULT_FALLBACK_MAX_MS))]
    pub fallback_max: Duration,

    /// TCP keepalive idle interval enabled on every backend connection once it reaches the
    /// connected state.
    #[builder(default = Duration::from_millis(DEFAULT_KEEPALIVE_IDLE_MS))]
    pub keepalive_idle: Duration,
}

impl ClientOptions {
    /// Validate cross-field invariants that a builder alone cannot express, failing fast before
    /// any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.target == 0 {
            return Err(Error::new(ErrorKind::InitialConnect {
                message: "target must be at least 1".to_string(),
            }));
        }
        if self.target > self.maximum {
            return Err(Error::new(ErrorKind::InitialConnect {
                message: format!(
                    "target ({}) must not exceed maximum ({})",
                    self.target, self.maximum
                ),
            }));
        }
        Ok(())
    }

    pub(crate) fn default_port(&self) -> u16 {
        match &self.discovery {
            DiscoveryMode::Direct { .. } => DEFAULT_DEFAULT_PORT,
            DiscoveryMode::Srv { default_port, .. } => *default_port,
        }
    }
}
