//! Upstream DNS server specifications.
//!
//! Parses upstream addresses in the forms users actually configure:
//! - `IP` or `IP:port` — plain DNS over UDP
//! - `tcp://IP[:port]` — plain DNS over TCP
//! - `tls://host[:port]` — DNS over TLS
//! - `https://...` — DNS over HTTPS
//! - `quic://host[:port]` — DNS over QUIC

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::TunnelError;

/// Transport protocol of an upstream DNS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    /// Plain DNS over UDP.
    Plain,
    /// Plain DNS over TCP.
    PlainTcp,
    /// DNS over TLS.
    Dot,
    /// DNS over HTTPS.
    Doh,
    /// DNS over QUIC.
    Doq,
}

impl UpstreamProtocol {
    /// Whether queries to this upstream leave the device encrypted.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, UpstreamProtocol::Plain | UpstreamProtocol::PlainTcp)
    }
}

/// A configured upstream DNS server. Immutable once built for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// The address exactly as configured (kept for display and equality).
    pub address: String,
    pub protocol: UpstreamProtocol,
}

impl Upstream {
    /// Build a plain-UDP upstream from a bare server address.
    pub fn plain(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocol: UpstreamProtocol::Plain,
        }
    }

    /// Socket address for datagram/stream transports (`Plain`, `PlainTcp`).
    /// Defaults to port 53 when none is given.
    pub fn socket_addr(&self) -> Result<SocketAddr, TunnelError> {
        parse_socket_addr(&self.address, 53)
    }

    /// Hostname and port for TLS-based transports (`Dot`, `Doq`).
    /// Defaults to port 853 when none is given.
    pub fn host_port(&self) -> Result<(String, u16), TunnelError> {
        let s = self.address.as_str();
        if let Some(colon) = s.rfind(':') {
            if let Ok(port) = s[colon + 1..].parse::<u16>() {
                return Ok((s[..colon].to_string(), port));
            }
        }
        if s.is_empty() {
            return Err(TunnelError::ResolverStart(
                "empty upstream hostname".into(),
            ));
        }
        Ok((s.to_string(), 853))
    }

    /// URL for the HTTPS transport (`Doh`).
    pub fn url(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            UpstreamProtocol::Plain => write!(f, "{}", self.address),
            UpstreamProtocol::PlainTcp => write!(f, "tcp://{}", self.address),
            UpstreamProtocol::Dot => write!(f, "tls://{}", self.address),
            UpstreamProtocol::Doh => write!(f, "{}", self.address),
            UpstreamProtocol::Doq => write!(f, "quic://{}", self.address),
        }
    }
}

impl FromStr for Upstream {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, TunnelError> {
        let s = s.trim();

        if s.starts_with("https://") {
            return Ok(Upstream {
                address: s.to_string(),
                protocol: UpstreamProtocol::Doh,
            });
        }
        if let Some(rest) = s.strip_prefix("tls://") {
            return stripped(rest, UpstreamProtocol::Dot);
        }
        if let Some(rest) = s.strip_prefix("quic://") {
            return stripped(rest, UpstreamProtocol::Doq);
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            parse_socket_addr(rest, 53)?;
            return Ok(Upstream {
                address: rest.to_string(),
                protocol: UpstreamProtocol::PlainTcp,
            });
        }

        parse_socket_addr(s, 53)?;
        Ok(Upstream {
            address: s.to_string(),
            protocol: UpstreamProtocol::Plain,
        })
    }
}

fn stripped(rest: &str, protocol: UpstreamProtocol) -> Result<Upstream, TunnelError> {
    if rest.is_empty() {
        return Err(TunnelError::ResolverStart(format!(
            "empty hostname in upstream address for {protocol:?}"
        )));
    }
    Ok(Upstream {
        address: rest.to_string(),
        protocol,
    })
}

/// Parse an IP address with optional port, defaulting to the given port.
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr, TunnelError> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // IPv6 in brackets: [::1]:port or [::1]
    if let Some(bracket_end) = s.strip_prefix('[').and_then(|r| r.find(']')) {
        let ip_str = &s[1..bracket_end + 1];
        let ip = ip_str.parse::<IpAddr>().map_err(|e| {
            TunnelError::ResolverStart(format!("invalid upstream address '{ip_str}': {e}"))
        })?;
        let rest = &s[bracket_end + 2..];
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse::<u16>().map_err(|e| {
                TunnelError::ResolverStart(format!("invalid upstream port '{p}': {e}"))
            })?,
            None => default_port,
        };
        return Ok(SocketAddr::new(ip, port));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // IPv4 with port: 1.2.3.4:5353
    if let Some(colon) = s.rfind(':') {
        let ip = s[..colon].parse::<IpAddr>().map_err(|e| {
            TunnelError::ResolverStart(format!("invalid upstream address '{}': {e}", &s[..colon]))
        })?;
        let port = s[colon + 1..].parse::<u16>().map_err(|e| {
            TunnelError::ResolverStart(format!("invalid upstream port '{}': {e}", &s[colon + 1..]))
        })?;
        return Ok(SocketAddr::new(ip, port));
    }

    Err(TunnelError::ResolverStart(format!(
        "cannot parse upstream address '{s}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_plain_ip_only() {
        let up: Upstream = "8.8.8.8".parse().unwrap();
        assert_eq!(up.protocol, UpstreamProtocol::Plain);
        assert_eq!(
            up.socket_addr().unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)
        );
    }

    #[test]
    fn test_parse_plain_with_port() {
        let up: Upstream = "8.8.8.8:5353".parse().unwrap();
        assert_eq!(up.socket_addr().unwrap().port(), 5353);
    }

    #[test]
    fn test_parse_tcp() {
        let up: Upstream = "tcp://9.9.9.9:853".parse().unwrap();
        assert_eq!(up.protocol, UpstreamProtocol::PlainTcp);
        assert_eq!(up.socket_addr().unwrap().port(), 853);
    }

    #[test]
    fn test_parse_dot_default_port() {
        let up: Upstream = "tls://dns.adguard-dns.com".parse().unwrap();
        assert_eq!(up.protocol, UpstreamProtocol::Dot);
        assert_eq!(
            up.host_port().unwrap(),
            ("dns.adguard-dns.com".to_string(), 853)
        );
    }

    #[test]
    fn test_parse_dot_with_port() {
        let up: Upstream = "tls://dns.example.org:8853".parse().unwrap();
        assert_eq!(up.host_port().unwrap(), ("dns.example.org".to_string(), 8853));
    }

    #[test]
    fn test_parse_doh() {
        let up: Upstream = "https://dns.adguard-dns.com/dns-query".parse().unwrap();
        assert_eq!(up.protocol, UpstreamProtocol::Doh);
        assert_eq!(up.url(), "https://dns.adguard-dns.com/dns-query");
    }

    #[test]
    fn test_parse_doq() {
        let up: Upstream = "quic://dns.adguard-dns.com".parse().unwrap();
        assert_eq!(up.protocol, UpstreamProtocol::Doq);
        assert!(up.protocol.is_encrypted());
    }

    #[test]
    fn test_parse_ipv6_bracketed() {
        let up: Upstream = "[2a10:50c0::ad1:ff]:53".parse().unwrap();
        assert!(up.socket_addr().unwrap().is_ipv6());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not an address".parse::<Upstream>().is_err());
        assert!("tls://".parse::<Upstream>().is_err());
    }

    #[test]
    fn test_encryption_classification() {
        assert!(!UpstreamProtocol::Plain.is_encrypted());
        assert!(!UpstreamProtocol::PlainTcp.is_encrypted());
        assert!(UpstreamProtocol::Dot.is_encrypted());
        assert!(UpstreamProtocol::Doh.is_encrypted());
        assert!(UpstreamProtocol::Doq.is_encrypted());
    }

    #[test]
    fn test_display_round_trips_prefix() {
        let up: Upstream = "tls://dns.example.org".parse().unwrap();
        assert_eq!(up.to_string(), "tls://dns.example.org");
        let up: Upstream = "94.140.14.140".parse().unwrap();
        assert_eq!(up.to_string(), "94.140.14.140");
    }
}
