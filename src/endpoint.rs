//! `transport://host:port` endpoint addresses.

use std::{fmt, str::FromStr};

use crate::error::TransportError;

/// Where a socket binds or connects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP address. A host of `*` binds every interface.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port number. `0` lets the OS choose when binding.
        port: u16,
    },
    /// A named in-process endpoint, resolved through a [`Context`](crate::socket::Context).
    Inproc(String),
}

impl Endpoint {
    /// Shorthand for an in-process endpoint.
    pub fn inproc(name: impl Into<String>) -> Self {
        Endpoint::Inproc(name.into())
    }

    /// Shorthand for a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` string to bind a TCP listener on.
    pub(crate) fn bind_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{port}")),
            Endpoint::Tcp { host, port } => Some(format!("{host}:{port}")),
            Endpoint::Inproc(_) => None,
        }
    }

    /// The `host:port` string to connect a TCP stream to.
    pub(crate) fn connect_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("127.0.0.1:{port}")),
            Endpoint::Tcp { host, port } => Some(format!("{host}:{port}")),
            Endpoint::Inproc(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransportError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason,
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing `://`"))?;
        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("missing port"))?;
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let port = port.parse().map_err(|_| invalid("port is not a number"))?;
                Ok(Endpoint::tcp(host, port))
            }
            "inproc" => {
                if rest.is_empty() {
                    return Err(invalid("missing name"));
                }
                Ok(Endpoint::inproc(rest))
            }
            _ => Err(invalid("unsupported transport")),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

/// Whether a socket listens for peers or dials a single peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SocketMode {
    /// Accept any number of peers.
    Bind,
    /// Dial one peer, reconnecting with backoff on loss.
    Connect,
}

impl fmt::Display for SocketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketMode::Bind => f.write_str("bind"),
            SocketMode::Connect => f.write_str("connect"),
        }
    }
}

/// An endpoint together with whether to bind or connect it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Link {
    /// The address.
    pub endpoint: Endpoint,
    /// Bind or connect.
    pub mode: SocketMode,
}

impl Link {
    /// Binds `endpoint`.
    pub fn bind(endpoint: Endpoint) -> Self {
        Link {
            endpoint,
            mode: SocketMode::Bind,
        }
    }

    /// Connects to `endpoint`.
    pub fn connect(endpoint: Endpoint) -> Self {
        Link {
            endpoint,
            mode: SocketMode::Connect,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mode, self.endpoint)
    }
}
