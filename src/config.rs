//! Process configuration, read once at startup.
//!
//! ```toml
//! tunnel_host = "0.0.0.0"
//! tunnel_port = 1081
//! proxy_port = 1080
//! log_level = "info"
//! ```
//!
//! Every key is optional.

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to resolve tunnel host {host}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Verbosity levels, from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Notify,
    Critical,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Also logs every byte sent and received.
    Dump,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Notify | LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Dump => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Notify => "notify",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Dump => "dump",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where the proxy listens for the agent, and where the agent dials.
    pub tunnel_host: String,
    pub tunnel_port: u16,
    /// Public SOCKS5 port of the proxy. Also reported in CONNECT replies.
    pub proxy_port: u16,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel_host: Ipv4Addr::UNSPECIFIED.to_string(),
            tunnel_port: 1081,
            proxy_port: 1080,
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// The tunnel endpoint. Host names resolve to their first address.
    pub fn tunnel_addr(&self) -> Result<SocketAddr, ConfigError> {
        let resolve_error = |source| ConfigError::Resolve {
            host: self.tunnel_host.clone(),
            source,
        };
        (self.tunnel_host.as_str(), self.tunnel_port)
            .to_socket_addrs()
            .map_err(resolve_error)?
            .next()
            .ok_or_else(|| resolve_error(io::ErrorKind::NotFound.into()))
    }

    /// The proxy listens on every interface.
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.proxy_port).into()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str("proxy_port = 9050\nlog_level = \"dump\"").unwrap();
        assert_eq!(
            config,
            Config {
                proxy_port: 9050,
                log_level: LogLevel::Dump,
                ..Config::default()
            }
        );
        assert_eq!(config.proxy_addr(), "0.0.0.0:9050".parse::<SocketAddr>().unwrap());
        assert_eq!(config.tunnel_addr().unwrap(), "0.0.0.0:1081".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn unknown_level_and_keys_are_rejected() {
        assert!(toml::from_str::<Config>("log_level = \"loud\"").is_err());
        assert!(toml::from_str::<Config>("tunnel = 1").is_err());
    }

    #[test]
    fn levels_map_onto_tracing() {
        assert_eq!(LogLevel::Notify.as_filter(), "error");
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::Dump.as_filter(), "trace");
        assert!(LogLevel::Notify < LogLevel::Dump);
    }

    #[test]
    fn load_reports_the_failing_step() {
        let dir = std::env::temp_dir().join(format!("rsocks5-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.toml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));

        let broken = dir.join("broken.toml");
        fs::write(&broken, "tunnel_port = \"many\"").unwrap();
        assert!(matches!(Config::load(&broken), Err(ConfigError::Parse { .. })));

        let good = dir.join("good.toml");
        fs::write(&good, "tunnel_host = \"127.0.0.1\"\ntunnel_port = 2000").unwrap();
        let config = Config::load(&good).unwrap();
        assert_eq!(config.tunnel_addr().unwrap(), "127.0.0.1:2000".parse::<SocketAddr>().unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }
}
