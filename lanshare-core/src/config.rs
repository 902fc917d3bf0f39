//! Per-instance service configuration. Deserialized from TOML; every field has a default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

/// What to do when the host's chunk callback refuses data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRefusal {
    /// Stop writing and close the connection.
    LocalOnly,
    /// Tell the sender with `FileStatus { Cancelled }`, then close.
    #[default]
    NotifySender,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// UDP port discovery listens on (default 9818).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Source port for outgoing announces; 0 picks an ephemeral port.
    #[serde(default)]
    pub discovery_send_port: u16,
    /// Where announces are sent. Empty means the limited broadcast address on `discovery_port`.
    #[serde(default)]
    pub broadcast_targets: Vec<SocketAddr>,
    #[serde(default = "default_data_bind_addr")]
    pub data_bind_addr: IpAddr,
    /// TCP port of the data service (default 9819). 0 binds an ephemeral port, which is then advertised.
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Only peers announcing the same group are listed.
    #[serde(default)]
    pub group: u8,
    /// Name announced to peers. Falls back to the stored identity, then the system host name.
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_auto_broadcast_interval_ms")]
    pub auto_broadcast_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// How long an incoming offer waits for the host before failing.
    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,
    #[serde(default)]
    pub chunk_refusal: ChunkRefusal,
}

fn default_discovery_port() -> u16 {
    9818
}
fn default_data_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_data_port() -> u16 {
    9819
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_stale_after_ms() -> u64 {
    10_000
}
fn default_auto_broadcast_interval_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_io_timeout_ms() -> u64 {
    10_000
}
fn default_offer_timeout_ms() -> u64 {
    60_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            discovery_send_port: 0,
            broadcast_targets: Vec::new(),
            data_bind_addr: default_data_bind_addr(),
            data_port: default_data_port(),
            group: 0,
            host_name: None,
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            auto_broadcast_interval_ms: default_auto_broadcast_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            offer_timeout_ms: default_offer_timeout_ms(),
            chunk_refusal: ChunkRefusal::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

impl ServiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Zero timings would make the loops spin or every exchange time out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("stale_after_ms", self.stale_after_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("io_timeout_ms", self.io_timeout_ms),
            ("offer_timeout_ms", self.offer_timeout_ms),
        ];
        for (field, ms) in timings {
            if ms == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// Configured targets, or `255.255.255.255:discovery_port` when none are set.
    pub fn broadcast_targets(&self) -> Vec<SocketAddr> {
        if self.broadcast_targets.is_empty() {
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.discovery_port,
            )]
        } else {
            self.broadcast_targets.clone()
        }
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.data_bind_addr, self.data_port)
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.discovery_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn auto_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.auto_broadcast_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}
