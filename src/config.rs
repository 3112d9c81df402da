//! Connection and engine settings
//!
//! Persisting these is up to the embedding application; this module only
//! defines the shapes and parses them from TOML fragments.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{VfsError, VfsResult};

/// Remote protocols the connection manager can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Sftp,
    Ftp,
    /// FTP with explicit TLS on the control connection
    Ftps,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp | Protocol::Ftps => 21,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Sftp => "sftp",
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
        }
    }
}

impl FromStr for Protocol {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sftp" => Ok(Protocol::Sftp),
            "ftp" => Ok(Protocol::Ftp),
            "ftps" => Ok(Protocol::Ftps),
            other => Err(VfsError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote server the user can connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logical name; at most one live session exists per name
    pub name: String,
    /// Protocol tag: `sftp`, `ftp` or `ftps`
    pub protocol: String,
    pub host: String,
    /// 0 selects the protocol's default port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Private key for SFTP public-key authentication
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.as_str().to_string(),
            host: host.into(),
            port: 0,
            user: String::new(),
            password: None,
            key_path: None,
        }
    }

    /// Parse the protocol tag
    pub fn protocol(&self) -> VfsResult<Protocol> {
        self.protocol.parse()
    }

    /// Configured port, or the protocol default when unset
    pub fn effective_port(&self, protocol: Protocol) -> u16 {
        if self.port == 0 {
            protocol.default_port()
        } else {
            self.port
        }
    }

    /// `host:port` suitable for address resolution
    pub fn address(&self, protocol: Protocol) -> String {
        format!("{}:{}", self.host, self.effective_port(protocol))
    }

    /// Password, treating an empty string as absent
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

/// Tunables shared by the backends and the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// TCP connect timeout for remote backends
    pub connect_timeout_secs: u64,
    /// Interval between FTP NOOP keep-alives
    pub keepalive_interval_secs: u64,
    /// Transfer chunk size in bytes
    pub chunk_size: usize,
    /// Minimum interval between progress updates delivered to the UI
    pub progress_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            keepalive_interval_secs: 60,
            chunk_size: 32 * 1024,
            progress_interval_ms: 50,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Chunk size, never zero
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    /// Parse settings from a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> VfsResult<Self> {
        toml_edit::de::from_str(content).map_err(|e| VfsError::Config(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// Parse `[[servers]]` tables from a TOML document
pub fn servers_from_toml_str(content: &str) -> VfsResult<Vec<ServerConfig>> {
    let list: ServerList =
        toml_edit::de::from_str(content).map_err(|e| VfsError::Config(e.to_string()))?;
    Ok(list.servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse_and_ports() {
        assert_eq!("SFTP".parse::<Protocol>().unwrap(), Protocol::Sftp);
        assert_eq!("ftps".parse::<Protocol>().unwrap().default_port(), 21);
        assert_eq!(Protocol::Sftp.default_port(), 22);

        let err = "webdav".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, VfsError::UnsupportedProtocol(p) if p == "webdav"));
    }

    #[test]
    fn test_effective_port() {
        let mut cfg = ServerConfig::new("box", Protocol::Sftp, "example.org");
        assert_eq!(cfg.effective_port(Protocol::Sftp), 22);
        assert_eq!(cfg.address(Protocol::Sftp), "example.org:22");
        cfg.port = 2222;
        assert_eq!(cfg.effective_port(Protocol::Sftp), 2222);
    }

    #[test]
    fn test_empty_password_is_absent() {
        let mut cfg = ServerConfig::new("box", Protocol::Ftp, "h");
        cfg.password = Some(String::new());
        assert_eq!(cfg.password(), None);
        cfg.password = Some("pw".into());
        assert_eq!(cfg.password(), Some("pw"));
    }

    #[test]
    fn test_settings_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str("chunk_size = 65536\n").unwrap();
        assert_eq!(settings.chunk_size, 65536);
        assert_eq!(settings.keepalive_interval_secs, 60);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));

        assert!(matches!(
            Settings::from_toml_str("chunk_size = \"big\""),
            Err(VfsError::Config(_))
        ));
    }

    #[test]
    fn test_servers_from_toml() {
        let doc = r#"
[[servers]]
name = "backup"
protocol = "sftp"
host = "10.0.0.5"
user = "admin"
key_path = "/home/admin/.ssh/id_ed25519"

[[servers]]
name = "mirror"
protocol = "ftp"
host = "ftp.example.org"
port = 2121
"#;
        let servers = servers_from_toml_str(doc).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].protocol().unwrap(), Protocol::Sftp);
        assert_eq!(servers[0].port, 0);
        assert!(servers[0].key_path.is_some());
        assert_eq!(servers[1].effective_port(Protocol::Ftp), 2121);
        assert_eq!(servers[1].password, None);
    }
}
