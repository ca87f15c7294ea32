//! Listen/target endpoints and the keys relays are registered under.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Transport a relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream relay.
    Tcp,
    /// Datagram relay.
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host/port pair as supplied by a rule.
///
/// The host is kept exactly as given. An empty host is allowed for listen
/// endpoints and means "all IPv4 interfaces".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse a listen endpoint from rule strings.
    pub fn listen(host: &str, port: &str) -> Result<Self> {
        Ok(Self {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }

    /// Parse a target endpoint from rule strings. The host must be present.
    pub fn target(host: &str, port: &str) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(Error::InvalidEndpoint("target address is empty".into()));
        }
        Ok(Self {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }

    /// Address string suitable for `bind`/`connect`/`lookup_host`.
    pub fn socket_addr_string(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };

        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a port string, accepting only 1-65535.
pub fn parse_port(port: &str) -> Result<u16> {
    let trimmed = port.trim();
    match trimmed.parse::<u16>() {
        Ok(0) => Err(Error::InvalidEndpoint(format!("port out of range: {}", trimmed))),
        Ok(p) => Ok(p),
        Err(_) => Err(Error::InvalidEndpoint(format!("invalid port: {:?}", port))),
    }
}

/// Identity of a relay: protocol plus the listen endpoint as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub protocol: Protocol,
    pub listen: Endpoint,
}

impl SessionKey {
    pub fn new(protocol: Protocol, listen: Endpoint) -> Self {
        Self { protocol, listen }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.listen)
    }
}
