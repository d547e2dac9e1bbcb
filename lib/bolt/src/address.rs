use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Maps an unresolved logical address to an ordered sequence of substitute
/// addresses. Each of those still goes through regular DNS resolution.
pub type Resolver = Arc<dyn Fn(&Address) -> Vec<Address> + Send + Sync>;

/// An unresolved logical endpoint. Used as the pool slot key and as the
/// currency of routing tables; resolution to socket addresses happens only
/// at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    #[inline]
    pub fn new<H: Into<String>>(host: H, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses a `host:port` string as found in routing records.
    pub fn parse(value: &str) -> Result<Address> {
        let (host, port) = match value.rfind(':') {
            Some(index) => (&value[..index], &value[index + 1..]),
            None => {
                return Err(Error::RoutingProtocol(format!(
                    "address {:?} has no port",
                    value
                )))
            }
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::RoutingProtocol(format!("address {:?} has an invalid port", value)))?;
        if host.is_empty() {
            return Err(Error::RoutingProtocol(format!(
                "address {:?} has no host",
                value
            )));
        }
        Ok(Address::new(host, port))
    }

    /// Resolves this address into concrete socket addresses, in the order
    /// they should be attempted. A custom resolver is applied first and may
    /// fan one logical address out into several; every yielded address then
    /// goes through OS DNS.
    pub fn resolve(&self, resolver: Option<&Resolver>) -> Result<Vec<SocketAddr>> {
        let unresolved = match resolver {
            Some(resolve) => resolve(self),
            None => vec![self.clone()],
        };
        let mut resolved = Vec::new();
        let mut last_error = None;
        for address in &unresolved {
            match (address.host.as_str(), address.port).to_socket_addrs() {
                Ok(addrs) => resolved.extend(addrs),
                Err(err) => last_error = Some(err),
            }
        }
        if resolved.is_empty() {
            return Err(Error::ServiceUnavailable(match last_error {
                Some(err) => format!("could not resolve address {}: {}", self, err),
                None => format!("could not resolve address {}", self),
            }));
        }
        Ok(resolved)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(&str, u16)> for Address {
    #[inline]
    fn from((host, port): (&str, u16)) -> Address {
        Address::new(host, port)
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Address {
        Address::new(addr.ip().to_string(), addr.port())
    }
}
