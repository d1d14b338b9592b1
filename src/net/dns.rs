//! Shared upstream resolver handle
//!
//! The backend config names a single DNS server for all outbound lookups.
//! Slots and peers hold clones of the handle; swapping the resolver affects
//! subsequent dials only, existing connections are untouched.

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use super::NetError;

const DEFAULT_DNS_PORT: u16 = 53;

/// Cloneable handle over a swappable resolver. With no resolver set, lookups
/// fall back to the system's own resolution.
#[derive(Clone, Default)]
pub struct DnsHandle {
    inner: Arc<RwLock<Option<Arc<TokioAsyncResolver>>>>,
}

impl DnsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points the handle at a DNS server given as `ip` or `ip:port`
    pub fn set(&self, addr: &str) -> Result<(), NetError> {
        let server = parse_resolver_addr(addr)?;

        let nameservers = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], nameservers);
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

        *self.inner.write().unwrap() = Some(Arc::new(resolver));

        Ok(())
    }

    /// Drops the configured resolver, reverting to system resolution
    pub fn clear(&self) {
        *self.inner.write().unwrap() = None;
    }

    fn resolver(&self) -> Option<Arc<TokioAsyncResolver>> {
        self.inner.read().unwrap().clone()
    }

    /// Resolves `host` to a socket address, preferring IPv4. IP literals
    /// short-circuit without a lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(resolver) = self.resolver() {
            let lookup = resolver
                .lookup_ip(host)
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::NotFound, err))?;

            return select_ipv4_preferred(lookup.into_iter().map(|ip| SocketAddr::new(ip, port)))
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
                });
        }

        let addrs = tokio::net::lookup_host((host, port)).await?;

        select_ipv4_preferred(addrs).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
        })
    }
}

fn parse_resolver_addr(addr: &str) -> Result<SocketAddr, NetError> {
    if let Ok(val) = addr.parse::<SocketAddr>() {
        return Ok(val);
    }

    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DNS_PORT));
    }

    Err(NetError::InvalidAddr(addr.to_string()))
}

fn select_ipv4_preferred(addrs: impl Iterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;

    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        if first.is_none() {
            first = Some(addr);
        }
    }

    first
}
