//! Address classification and outbound connectivity helpers

mod dialer;
mod dns;

pub use dialer::Dialer;
pub use dns::DnsHandle;

use std::net::IpAddr;
use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    #[error("not an ip address: {0}")]
    NotAnIp(String),

    #[error("address not assigned to a local interface: {0}")]
    NotLocal(IpAddr),

    #[error("unsupported protocol: {0}")]
    UnsupportedProto(String),
}

/// Whether a destination names an address this node must refuse to relay to:
/// loopback, private, or unspecified. Hostnames are intentionally not
/// resolved here; domain destinations pass through.
pub fn is_local_address(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let Ok(ip) = host.parse::<IpAddr>() else {
        return false;
    };

    match ip {
        IpAddr::V4(val) => val.is_loopback() || val.is_private() || val.is_unspecified(),
        IpAddr::V6(val) => {
            // fc00::/7 is the v6 unique-local range
            val.is_loopback() || val.is_unspecified() || (val.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Parses a framed IP assignment. An empty value means no bind override;
/// an address no local interface carries is an error so the caller can log
/// it and fall back to an unbound dialer.
pub fn parse_framed_ip(val: &str) -> Result<Option<IpAddr>, NetError> {
    if val.is_empty() {
        return Ok(None);
    }

    let ip: IpAddr = val.parse().map_err(|_| NetError::NotAnIp(val.to_string()))?;

    // a throwaway ephemeral bind proves the address is assigned to this host
    if std::net::UdpSocket::bind((ip, 0)).is_err() {
        return Err(NetError::NotLocal(ip));
    }

    Ok(Some(ip))
}
