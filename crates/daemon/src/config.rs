use crate::error::ConfigError;
use crate::liveness::{local_hostname, OsProbe};
use crate::registry::DEFAULT_GRACE_SECS;
use clap::Parser;
use portalloc_common::DEFAULT_DISCOVERY_FILE;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Hands out session ports to kernels", long_about = None)]
pub struct Config {
    /// Comma separated ports available for lease
    #[arg(long, env = "SPARK_PORTS", default_value = "")]
    pub ports: String,

    /// File the listening port is published to
    #[arg(long, env = "PORT_ALLOCATOR_FILE", default_value = DEFAULT_DISCOVERY_FILE)]
    pub discovery_file: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to listen on (0 lets the OS choose)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Host probed for listeners on leased ports [default: this machine's hostname]
    #[arg(long)]
    pub probe_host: Option<String>,

    /// Connect timeout for port probes
    #[arg(long, default_value_t = 200)]
    pub probe_timeout_ms: u64,

    /// Seconds a lease may stay connecting before it is probed
    #[arg(long, default_value_t = DEFAULT_GRACE_SECS)]
    pub grace_secs: i64,
}

impl Config {
    pub fn pool(&self) -> Result<Vec<u16>, ConfigError> {
        parse_ports(&self.ports)
    }

    pub fn grace(&self) -> Result<chrono::Duration, ConfigError> {
        if self.grace_secs < 0 {
            return Err(ConfigError::NegativeGrace(self.grace_secs));
        }
        Ok(chrono::Duration::seconds(self.grace_secs))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn probe(&self) -> OsProbe {
        let host = self.probe_host.clone().unwrap_or_else(local_hostname);
        OsProbe::new(host, Duration::from_millis(self.probe_timeout_ms))
    }
}

/// Parse a comma separated port list. Blank entries are skipped.
pub fn parse_ports(list: &str) -> Result<Vec<u16>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(entry.to_string()))
        })
        .collect()
}
