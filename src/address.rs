//! Hosts, ports and the canonical addresses connections are keyed by.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

/// A UDP or TCP port.
pub type Port = u16;

/// A validated IP host.
///
/// IPv4-mapped IPv6 addresses are stored in their IPv4 form, so that the same peer always
/// maps to the same registry key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "IpAddr")]
pub struct Host(IpAddr);

impl Host {
    /// Returns the IP address of this host.
    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Whether this is the unspecified address, `0.0.0.0` or `::`.
    pub fn is_wildcard(&self) -> bool {
        self.0.is_unspecified()
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_canonical())
    }
}

impl From<Ipv4Addr> for Host {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IpAddr::V4(ip))
    }
}

impl From<Ipv6Addr> for Host {
    fn from(ip: Ipv6Addr) -> Self {
        IpAddr::V6(ip).into()
    }
}

impl From<Host> for IpAddr {
    fn from(host: Host) -> Self {
        host.0
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host({})", self.0)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Host {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(s);
        trimmed
            .parse::<IpAddr>()
            .map(Host::from)
            .map_err(|_| InvalidSnafu { input: s }.build())
    }
}

/// A canonical host and port pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: Host,
    port: Port,
}

impl Address {
    /// Creates a new address.
    pub fn new(host: Host, port: Port) -> Self {
        Self { host, port }
    }

    /// Creates an address that connections may be opened towards.
    ///
    /// Wildcard hosts are rejected, they are only meaningful for binding.
    pub fn target(host: Host, port: Port) -> Result<Self, AddressError> {
        snafu::ensure!(!host.is_wildcard(), WildcardSnafu { host });
        Ok(Self::new(host, port))
    }

    /// The host of this address.
    pub fn host(&self) -> Host {
        self.host
    }

    /// The port of this address.
    pub fn port(&self) -> Port {
        self.port
    }

    /// This address as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host.ip(), self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().into(), addr.port())
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.socket_addr()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.socket_addr())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Address::from)
            .map_err(|_| InvalidSnafu { input: s }.build())
    }
}

/// Error for invalid hosts and addresses.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AddressError {
    #[snafu(display("invalid address: {input}"))]
    Invalid { input: String },
    #[snafu(display("cannot connect to wildcard host {host}"))]
    Wildcard { host: Host },
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn test_host_canonical() {
        let mapped: IpAddr = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 1).into();
        let host = Host::from(mapped);
        assert_eq!(host.to_string(), "127.0.0.1");
        assert_eq!("[::1]".parse::<Host>().unwrap().to_string(), "::1");
        assert!("localhost".parse::<Host>().is_err());
    }

    #[test]
    fn test_host_from_ip_versions() {
        let host: Host = Ipv4Addr::LOCALHOST.into();
        assert_eq!(host.ip(), IpAddr::from(Ipv4Addr::LOCALHOST));
        let mapped: Host = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 1).into();
        assert_eq!(mapped, host);
        let host: Host = Ipv6Addr::LOCALHOST.into();
        assert_eq!(host.to_string(), "::1");
    }

    #[test]
    fn test_target_rejects_wildcard() {
        let wildcard: Host = "0.0.0.0".parse().unwrap();
        assert!(matches!(
            Address::target(wildcard, 80),
            Err(AddressError::Wildcard { .. })
        ));
        let wildcard: Host = "::".parse().unwrap();
        assert!(Address::target(wildcard, 80).is_err());
        let host: Host = "10.0.0.1".parse().unwrap();
        let addr = Address::target(host, 80).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.1:80");
    }

    #[test]
    fn test_address_parse() {
        let addr: Address = "[::ffff:10.1.2.3]:1234".parse().unwrap();
        assert_eq!(addr.host().to_string(), "10.1.2.3");
        assert_eq!(addr.port(), 1234);
        assert_eq!(addr.to_string(), "10.1.2.3:1234");
        assert!("10.1.2.3".parse::<Address>().is_err());
    }
}
