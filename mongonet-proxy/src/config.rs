//! Proxy configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MONGONET_CONFIG or --config)
//! 3. Environment variables
//!
//! Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client-facing listener.
    pub network: NetworkConfig,
    /// The single backend node.
    pub backend: BackendConfig,
    /// Client-facing TLS.
    pub tls: TlsConfig,
    /// Metrics endpoint.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from the file named by `MONGONET_CONFIG` (if set), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("MONGONET_CONFIG") {
            Ok(path) => Self::load_from(path),
            Err(_) => Ok(Self::from_env()),
        }
    }

    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.backend.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.backend.validate()?;
        self.tls.validate()?;
        if self.metrics.enabled && self.metrics.bind_addr == self.network.bind_addr {
            return Err(ConfigError::Validation(format!(
                "metrics and proxy cannot share {}",
                self.network.bind_addr
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        env_parse("MONGONET_BIND", &mut self.bind_addr);
        env_parse("MONGONET_MAX_CONNECTIONS", &mut self.max_connections);
    }
}

/// Backend node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port` of the backend node.
    pub addr: String,
    /// Idle connections kept in the pool; extra released connections are closed.
    pub max_idle: usize,
    /// TLS towards the backend.
    pub tls: BackendTlsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", mongonet_protocol::DEFAULT_PORT),
            max_idle: 64,
            tls: BackendTlsConfig::default(),
        }
    }
}

impl BackendConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MONGONET_BACKEND") {
            if !addr.is_empty() {
                self.addr = addr;
            }
        }
        env_parse("MONGONET_BACKEND_MAX_IDLE", &mut self.max_idle);
        env_bool("MONGONET_BACKEND_TLS", &mut self.tls.enabled);
        env_bool("MONGONET_BACKEND_TLS_INSECURE", &mut self.tls.insecure);
        if let Ok(path) = std::env::var("MONGONET_BACKEND_TLS_CA") {
            self.tls.ca_path = Some(PathBuf::from(path));
        }
        if let Ok(name) = std::env::var("MONGONET_BACKEND_TLS_SERVER_NAME") {
            self.tls.server_name = Some(name);
        }
    }

    /// Host part of `addr`, used as the default SNI name.
    pub fn host(&self) -> &str {
        match self.addr.rfind(':') {
            Some(idx) => self.addr[..idx].trim_start_matches('[').trim_end_matches(']'),
            None => &self.addr,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::Validation("backend addr not set".to_string()));
        }
        if !self.addr.contains(':') {
            return Err(ConfigError::Validation(format!(
                "backend addr '{}' must be host:port",
                self.addr
            )));
        }
        self.tls.validate()
    }
}

/// TLS settings for backend connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTlsConfig {
    /// Dial the backend over TLS.
    pub enabled: bool,
    /// PEM CA bundle; the webpki roots are used when unset.
    pub ca_path: Option<PathBuf>,
    /// Skip certificate verification. Development only.
    pub insecure: bool,
    /// SNI name sent to the backend; defaults to the host of `addr`.
    pub server_name: Option<String>,
}

impl BackendTlsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            if self.insecure && self.ca_path.is_some() {
                return Err(ConfigError::Validation(
                    "backend TLS cannot be insecure and pin a CA at the same time".to_string(),
                ));
            }
            return Ok(());
        }
        if self.insecure || self.ca_path.is_some() || self.server_name.is_some() {
            return Err(ConfigError::Validation(
                "backend TLS options set but backend TLS is disabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client-facing TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        env_bool("MONGONET_TLS_ENABLED", &mut self.enabled);
        if let Ok(path) = std::env::var("MONGONET_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("MONGONET_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        env_bool(
            "MONGONET_TLS_REQUIRE_CLIENT_CERT",
            &mut self.require_client_cert,
        );
        if let Ok(path) = std::env::var("MONGONET_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::Validation(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        env_bool("MONGONET_METRICS_ENABLED", &mut self.enabled);
        env_parse("MONGONET_METRICS_BIND", &mut self.bind_addr);
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(key) {
        *target = value == "1" || value.eq_ignore_ascii_case("true");
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(value) = std::env::var(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("ignoring unparsable {}={}", key, value),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {1}", path = .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{path}': {1}", path = .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 9999);
        assert_eq!(config.backend.addr, "127.0.0.1:27017");
        assert!(!config.backend.tls.enabled);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.backend.addr, config.backend.addr);
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:27018\"\nbackend:\n  addr: \"db.internal:27017\"\n  tls:\n    enabled: true\n    server_name: \"db.example.com\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 27018);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.backend.addr, "db.internal:27017");
        assert_eq!(config.backend.host(), "db.internal");
        assert_eq!(
            config.backend.tls.server_name.as_deref(),
            Some("db.example.com")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_errors() {
        let missing = Config::from_file("/nonexistent/mongonet.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(..))));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();
        let bad = Config::from_file(file.path());
        assert!(matches!(bad, Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_save_and_reload() {
        let file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.backend.max_idle = 3;
        config.save(file.path()).unwrap();
        let reloaded = Config::from_file(file.path()).unwrap();
        assert_eq!(reloaded.backend.max_idle, 3);
    }

    #[test]
    fn test_validate_rejects_inconsistent_tls() {
        let mut config = Config::default();
        config.tls.enabled = true;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backend.tls.insecure = true;
        assert!(config.validate().is_err());

        config.backend.tls.enabled = true;
        assert!(config.validate().is_ok());

        config.backend.tls.ca_path = Some(PathBuf::from("/etc/ca.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backend_addr() {
        let mut config = Config::default();
        config.backend.addr = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(msg)) if msg.contains("host:port")
        ));
    }

    #[test]
    fn test_backend_host_ipv6() {
        let backend = BackendConfig {
            addr: "[::1]:27017".to_string(),
            ..Default::default()
        };
        assert_eq!(backend.host(), "::1");
    }
}
