//! Listen address resolution.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Resolve a `host:port` string into a single socket address.
///
/// An empty host (`":9001"`) resolves to the unspecified IPv4 address. IPv6
/// literals are written in brackets (`"[::1]:9001"`). Host names go through
/// the system resolver and the first result wins.
pub fn resolve(address: &str) -> Result<SocketAddr> {
    let invalid = |reason: &str| Error::Address {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?,
        None if host.contains(':') => return Err(invalid("IPv6 literal must be bracketed")),
        None => host,
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses"))
}

/// Whether a listener bound to `bound` can serve `requested`.
///
/// Ports must match. Addresses match when equal or when either side is the
/// unspecified address.
pub fn listener_matches(requested: SocketAddr, bound: SocketAddr) -> bool {
    if requested.port() != bound.port() {
        return false;
    }
    requested.ip().is_unspecified() || bound.ip().is_unspecified() || requested.ip() == bound.ip()
}
