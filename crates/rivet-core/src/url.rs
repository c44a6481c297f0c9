//! Address grammar: `ip:port[?key=value&key=value...]`.

use std::time::Duration;

use crate::config::Config;
use crate::error::RemotingError;
use crate::protocol::{ProtocolManager, PROTOCOL_V1};

/// A parsed remoting address with its per-connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
    /// TCP connect timeout for this address.
    pub connect_timeout: Duration,
    /// Protocol code byte used when framing on connections to this address.
    pub protocol: u8,
    /// Protocol minor version carried in each command's `ver2` byte.
    pub version: u8,
    /// Target pool size.
    pub conn_num: usize,
    /// Create the full pool synchronously on first use.
    pub warmup: bool,
    /// Override of the idle-detect interval for connections to this address.
    pub idle_timeout: Option<Duration>,
    origin: String,
}

impl Url {
    pub const KEY_CONNECT_TIMEOUT: &'static str = "_CONNECTTIMEOUT";
    pub const KEY_PROTOCOL: &'static str = "_PROTOCOL";
    pub const KEY_VERSION: &'static str = "_VERSION";
    pub const KEY_CONNECTION_NUM: &'static str = "_CONNECTIONNUM";
    pub const KEY_CONNECTION_WARMUP: &'static str = "_CONNECTIONWARMUP";
    pub const KEY_IDLE_TIMEOUT: &'static str = "_IDLETIMEOUT";

    /// Parse an address string, filling unspecified options from `config`.
    pub fn parse(addr: &str, config: &Config) -> Result<Self, RemotingError> {
        let bad = || RemotingError::BadAddress(addr.to_string());

        let (hostport, query) = match addr.split_once('?') {
            Some((h, q)) => (h, Some(q)),
            None => (addr, None),
        };
        let (host, port) = hostport.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port: u16 = port.parse().map_err(|_| bad())?;

        let mut url = Url {
            host: host.to_string(),
            port,
            connect_timeout: config.connect_timeout,
            protocol: PROTOCOL_V1,
            version: 1,
            conn_num: 1,
            warmup: false,
            idle_timeout: None,
            origin: addr.to_string(),
        };

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(bad)?;
                match key {
                    Self::KEY_CONNECT_TIMEOUT => {
                        let ms: u64 = value.parse().map_err(|_| bad())?;
                        url.connect_timeout = Duration::from_millis(ms);
                    }
                    Self::KEY_PROTOCOL => {
                        let code: u8 = value.parse().map_err(|_| bad())?;
                        if !ProtocolManager::global().contains(code) {
                            return Err(bad());
                        }
                        url.protocol = code;
                    }
                    Self::KEY_VERSION => {
                        url.version = value.parse().map_err(|_| bad())?;
                    }
                    Self::KEY_CONNECTION_NUM => {
                        let n: usize = value.parse().map_err(|_| bad())?;
                        url.conn_num = n.max(1);
                    }
                    Self::KEY_CONNECTION_WARMUP => {
                        url.warmup = value.parse().map_err(|_| bad())?;
                    }
                    Self::KEY_IDLE_TIMEOUT => {
                        let ms: u64 = value.parse().map_err(|_| bad())?;
                        url.idle_timeout = Some(Duration::from_millis(ms));
                    }
                    other => {
                        tracing::debug!(key = other, addr, "ignoring unrecognized url option");
                    }
                }
            }
        }
        Ok(url)
    }

    /// Build a plain URL from an accepted peer address (server side).
    pub(crate) fn from_peer(addr: std::net::SocketAddr, config: &Config) -> Self {
        Url {
            host: addr.ip().to_string(),
            port: addr.port(),
            connect_timeout: config.connect_timeout,
            protocol: PROTOCOL_V1,
            version: 1,
            conn_num: 1,
            warmup: false,
            idle_timeout: None,
            origin: addr.to_string(),
        }
    }

    /// Pool key for this address. Options do not participate, so the same
    /// peer reached with different options shares one pool.
    pub fn unique_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The string this URL was parsed from.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::from_env()
    }

    #[test]
    fn parses_bare_host_port() {
        let url = Url::parse("127.0.0.1:8080", &cfg()).unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 8080);
        assert_eq!(url.conn_num, 1);
        assert!(!url.warmup);
        assert_eq!(url.unique_key(), "127.0.0.1:8080");
    }

    #[test]
    fn parses_options() {
        let url = Url::parse(
            "10.0.0.3:12200?_CONNECTTIMEOUT=3000&_CONNECTIONNUM=4&_CONNECTIONWARMUP=true",
            &cfg(),
        )
        .unwrap();
        assert_eq!(url.connect_timeout, Duration::from_millis(3000));
        assert_eq!(url.conn_num, 4);
        assert!(url.warmup);
    }

    #[test]
    fn idle_override_and_version() {
        let url = Url::parse("h:1?_IDLETIMEOUT=500&_VERSION=2", &cfg()).unwrap();
        assert_eq!(url.idle_timeout, Some(Duration::from_millis(500)));
        assert_eq!(url.version, 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Url::parse("no-port-here", &cfg()).is_err());
        assert!(Url::parse(":8080", &cfg()).is_err());
        assert!(Url::parse("h:notaport", &cfg()).is_err());
        assert!(Url::parse("h:1?_CONNECTTIMEOUT=abc", &cfg()).is_err());
        assert!(Url::parse("h:1?_PROTOCOL=77", &cfg()).is_err());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let url = Url::parse("h:1?_TASTESGREAT=true", &cfg()).unwrap();
        assert_eq!(url.port, 1);
    }
}
