//! Configuration
//!
//! Startup configuration for servers and clients: transport selection,
//! addressing, capacity and framing limits. Values are immutable once a
//! `start` or `connect` call has consumed them; changing them requires a
//! fresh start.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;

use crate::message::DEFAULT_MAX_PAYLOAD;

/// Default port used by the demos when none is configured.
pub const DEFAULT_PORT: u16 = 4312;

/// Default client capacity of a freshly constructed server.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Hard ceiling on the configurable client capacity.
pub const MAX_CLIENTS_LIMIT: usize = 1024;

/// Longest accepted hostname.
pub const MAX_HOST_LEN: usize = 100;

/// Longest accepted IP literal (a scoped IPv6 address fits in 46 bytes).
pub const MAX_IP_LEN: usize = 46;

/// Transport protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// IP protocol version selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IpVersion {
    #[serde(rename = "v4")]
    V4,
    #[serde(rename = "v6")]
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "v4"),
            IpVersion::V6 => write!(f, "v6"),
        }
    }
}

/// Server startup configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind: a hostname or an IP literal of the configured family.
    pub bind_addr: String,

    /// Port to listen on. Port 0 binds an OS-assigned ephemeral port,
    /// readable afterwards through `Server::local_addr`.
    pub port: u16,

    pub transport: Transport,
    pub ip_version: IpVersion,

    /// Maximum number of simultaneously registered clients.
    pub max_clients: usize,

    /// Maximum payload bytes in a single message.
    pub max_payload: usize,

    /// Spawn a receive worker for every accepted client. When disabled,
    /// workers are attached per client via `Server::start_receiver`.
    pub auto_receive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            transport: Transport::Tcp,
            ip_version: IpVersion::V4,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            auto_receive: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from sockline.toml with environment overrides
    /// (`SOCKLINE_PORT`, `SOCKLINE_MAX_CLIENTS`, ...). Missing keys fall
    /// back to the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("sockline").required(false))
            .add_source(Environment::with_prefix("SOCKLINE"))
            .build()?;

        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host(&self.bind_addr)?;

        if self.max_clients == 0 {
            return Err(ConfigError::Message(
                "max_clients must be greater than 0".into(),
            ));
        }

        if self.max_clients > MAX_CLIENTS_LIMIT {
            return Err(ConfigError::Message(format!(
                "max_clients cannot exceed {}",
                MAX_CLIENTS_LIMIT
            )));
        }

        if self.max_payload == 0 {
            return Err(ConfigError::Message(
                "max_payload must be greater than 0".into(),
            ));
        }

        if self.max_payload > u32::MAX as usize {
            return Err(ConfigError::Message(
                "max_payload does not fit the wire header".into(),
            ));
        }

        Ok(())
    }
}

/// Client startup configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to reach: a hostname or an IP literal of the configured family.
    pub server_addr: String,

    pub port: u16,
    pub transport: Transport,
    pub ip_version: IpVersion,

    /// Maximum payload bytes in a single message.
    pub max_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            transport: Transport::Tcp,
            ip_version: IpVersion::V4,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ClientConfig {
    /// Load configuration from sockline-client.toml with environment
    /// overrides (`SOCKLINE_CLIENT_PORT`, ...).
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("sockline-client").required(false))
            .add_source(Environment::with_prefix("SOCKLINE_CLIENT"))
            .build()?;

        let config: ClientConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host(&self.server_addr)?;

        if self.port == 0 {
            return Err(ConfigError::Message("port cannot be 0".into()));
        }

        if self.max_payload == 0 {
            return Err(ConfigError::Message(
                "max_payload must be greater than 0".into(),
            ));
        }

        if self.max_payload > u32::MAX as usize {
            return Err(ConfigError::Message(
                "max_payload does not fit the wire header".into(),
            ));
        }

        Ok(())
    }
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::Message("address cannot be empty".into()));
    }

    let limit = if host.parse::<IpAddr>().is_ok() {
        MAX_IP_LEN
    } else {
        MAX_HOST_LEN
    };
    if host.len() > limit {
        return Err(ConfigError::Message(format!(
            "address too long: {} bytes (limit {})",
            host.len(),
            limit
        )));
    }

    Ok(())
}
