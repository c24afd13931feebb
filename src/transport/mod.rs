//! Transports a drone uses to reach its overseer

pub mod tcp;
pub mod traits;
pub mod unix;

pub use tcp::TcpConnector;
pub use traits::{TransportConnector, TransportStream};
pub use unix::UnixConnector;

use std::net::SocketAddr;
use std::path::PathBuf;

/// Where the overseer listens, as given by `--endpoint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// `tcp://host:port` or a literal socket address selects TCP; anything
    /// else is a UNIX socket path
    pub fn parse(endpoint: &str) -> Self {
        if let Some(address) = endpoint.strip_prefix("tcp://") {
            return Endpoint::Tcp(address.to_string());
        }
        if endpoint.parse::<SocketAddr>().is_ok() {
            return Endpoint::Tcp(endpoint.to_string());
        }
        Endpoint::Unix(PathBuf::from(endpoint.strip_prefix("unix://").unwrap_or(endpoint)))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(address) => write!(f, "tcp://{}", address),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_selects_transport() {
        assert_eq!(
            Endpoint::parse("127.0.0.1:10054"),
            Endpoint::Tcp("127.0.0.1:10054".into())
        );
        assert_eq!(
            Endpoint::parse("tcp://overseer.local:10054"),
            Endpoint::Tcp("overseer.local:10054".into())
        );
        assert_eq!(
            Endpoint::parse("/tmp/hive-app.sock"),
            Endpoint::Unix(PathBuf::from("/tmp/hive-app.sock"))
        );
        assert_eq!(
            Endpoint::parse("unix:///run/hive.sock"),
            Endpoint::Unix(PathBuf::from("/run/hive.sock"))
        );
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::parse("/tmp/a.sock").to_string(), "unix:///tmp/a.sock");
        assert_eq!(Endpoint::parse("[::1]:9").to_string(), "tcp://[::1]:9");
    }
}
