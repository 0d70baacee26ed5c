//! Service discovery. Produces a changing set of backends from either a fixed list of
//! `host:port` pairs (direct mode) or a DNS SRV record (SRV mode), diffed on a timer into
//! `added`/`removed` events.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

#[cfg(feature = "dns-resolver")]
use hickory_resolver::{config::ResolverConfig, Name, TokioResolver};

use crate::options::{ClientOptions, DiscoveryMode, RecoveryPolicy};

/// A single reachable backend, as produced by the resolver.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display("{name} ({address}:{port})")]
pub struct Backend {
    /// Stable opaque identifier for this specific backend incarnation. Two successive
    /// in-service appearances of the same address may have different keys (e.g. a SRV target
    /// that drops out and returns gets a fresh key).
    pub key: String,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl Backend {
    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Overall state of the discovery process, surfaced to the [`Client`](crate::client::Client) so
/// it can implement `failFast`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyState {
    Starting,
    Running,
    Failed,
    Stopped,
}

/// An event produced by the resolver.
#[derive(Clone, Debug)]
pub enum ResolverEvent {
    Added(Backend),
    Removed(String),
    StateChanged(TopologyState),
}

/// Contract satisfied by anything that can drive backend discovery. A resolver owns its own
/// background task; it is handed the sending half of a channel and runs until that channel's
/// receiver is dropped.
pub trait Resolver: Send + 'static {
    fn spawn(self: Box<Self>, events: mpsc::UnboundedSender<ResolverEvent>) -> tokio::task::JoinHandle<()>;
}

/// Default DNS-backed resolver, covering both direct and SRV discovery modes.
pub struct DnsResolver {
    discovery: DiscoveryMode,
    recovery_dns: RecoveryPolicy,
    recovery_dns_srv: RecoveryPolicy,
    poll_interval: Duration,
    #[cfg(feature = "dns-resolver")]
    resolver_config: Option<ResolverConfig>,
}

impl DnsResolver {
    pub fn from_options(options: &ClientOptions) -> Self {
        Self {
            discovery: options.discovery.clone(),
            recovery_dns: options.recovery_dns.clone(),
            recovery_dns_srv: options.recovery_dns_srv.clone(),
            poll_interval: Duration::from_secs(30),
            #[cfg(feature = "dns-resolver")]
            resolver_config: None,
        }
    }
}

impl Resolver for DnsResolver {
    fn spawn(self: Box<Self>, events: mpsc::UnboundedSender<ResolverEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }
}

impl DnsResolver {
    async fn run(self, events: mpsc::UnboundedSender<ResolverEvent>) {
        let mut known: HashMap<String, Backend> = HashMap::new();
        let mut next_generation: u64 = 0;
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            match self.resolve_once(&mut next_generation).await {
                Ok(fresh) => {
                    self.diff_and_emit(&mut known, fresh, &events);
                }
                Err(e) => {
                    warn!(error = %e, "dns resolution attempt failed, retaining previous backend set");
                }
            }

            if events.is_closed() {
                break;
            }
        }
    }

    /// Resolve the configured discovery mode once, assigning a fresh key to every backend found
    /// (the diff step in [`diff_and_emit`] reconciles these against `known` by address so that
    /// unchanged backends keep their existing key).
    async fn resolve_once(
        &self,
        next_generation: &mut u64,
    ) -> crate::error::Result<Vec<Backend>> {
        match &self.discovery {
            DiscoveryMode::Direct { hosts } => Ok(hosts
                .iter()
                .map(|addr| Backend {
                    key: format!("direct-{}", addr),
                    name: addr.to_string(),
                    address: addr.ip(),
                    port: addr.port(),
                })
                .collect()),
            #[cfg(feature = "dns-resolver")]
            DiscoveryMode::Srv {
                service,
                default_port,
            } => {
                self.resolve_srv(service, *default_port, next_generation)
                    .await
            }
            #[cfg(not(feature = "dns-resolver"))]
            DiscoveryMode::Srv { .. } => Err(crate::error::Error::resolver(
                "SRV discovery requires the `dns-resolver` feature",
            )),
        }
    }

    #[cfg(feature = "dns-resolver")]
    async fn resolve_srv(
        &self,
        service: &str,
        default_port: u16,
        next_generation: &mut u64,
    ) -> crate::error::Result<Vec<Backend>> {
        let resolver = self.build_resolver().await?;

        let targets = retry(&self.recovery_dns_srv, || async {
            let name = Name::from_str_relaxed(service)
                .map_err(|e| crate::error::Error::resolver(e.to_string()))?;
            let lookup = resolver
                .srv_lookup(name)
                .await
                .map_err(|e| crate::error::Error::resolver(e.to_string()))?;
            Ok(lookup
                .into_iter()
                .map(|srv| (srv.target().to_utf8(), srv.port()))
                .collect::<Vec<_>>())
        })
        .await?;

        let mut backends = Vec::with_capacity(targets.len());
        for (host, port) in targets {
            let port = if port == 0 { default_port } else { port };
            let addrs = retry(&self.recovery_dns, || async {
                let name = Name::from_str_relaxed(&host)
                    .map_err(|e| crate::error::Error::resolver(e.to_string()))?;
                resolver
                    .lookup_ip(name)
                    .await
                    .map_err(|e| crate::error::Error::resolver(e.to_string()))
            })
            .await?;

            for addr in addrs.iter() {
                *next_generation += 1;
                backends.push(Backend {
                    key: format!("{host}#{}", *next_generation),
                    name: host.clone(),
                    address: addr,
                    port,
                });
            }
        }

        Ok(backends)
    }

    #[cfg(feature = "dns-resolver")]
    async fn build_resolver(&self) -> crate::error::Result<TokioResolver> {
        let builder = match &self.resolver_config {
            Some(config) => TokioResolver::builder_with_config(config.clone(), Default::default()),
            None => TokioResolver::builder_tokio()
                .map_err(|e| crate::error::Error::resolver(e.to_string()))?,
        };
        Ok(builder.build())
    }

    /// Diff a freshly-resolved backend set against the previously known one by address, emitting
    /// `added`/`removed` only for the actual differences. A SRV target that disappears and
    /// reappears is treated as a brand new backend (fresh key), per the data model's definition
    /// of `key`.
    fn diff_and_emit(
        &self,
        known: &mut HashMap<String, Backend>,
        fresh: Vec<Backend>,
        events: &mpsc::UnboundedSender<ResolverEvent>,
    ) {
        let fresh_by_addr: HashMap<SocketAddr, Backend> = fresh
            .into_iter()
            .map(|b| (b.socket_addr(), b))
            .collect();

        let removed_keys: Vec<String> = known
            .iter()
            .filter(|(_, b)| !fresh_by_addr.contains_key(&b.socket_addr()))
            .map(|(k, _)| k.clone())
            .collect();

        for key in removed_keys {
            known.remove(&key);
            debug!(%key, "backend removed");
            let _ = events.send(ResolverEvent::Removed(key));
        }

        let already_present: std::collections::HashSet<SocketAddr> =
            known.values().map(Backend::socket_addr).collect();

        for (addr, backend) in fresh_by_addr {
            if !already_present.contains(&addr) {
                debug!(key = %backend.key, %backend, "backend added");
                known.insert(backend.key.clone(), backend.clone());
                let _ = events.send(ResolverEvent::Added(backend));
            }
        }
    }
}

/// Run `attempt` with capped exponential backoff plus jitter, per `policy`.
pub(crate) async fn retry<T, F, Fut>(policy: &RecoveryPolicy, mut attempt: F) -> crate::error::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<T>>,
{
    use rand::Rng;

    let mut delay = policy.delay;
    let mut tries_left = policy.retries + 1;

    loop {
        tries_left -= 1;
        match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if tries_left == 0 => return Err(e),
            Err(_elapsed) if tries_left == 0 => {
                return Err(crate::error::Error::resolver("timed out"));
            }
            _ => {
                let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 4 + 1);
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
        }
    }
}
