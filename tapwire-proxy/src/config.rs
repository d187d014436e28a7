use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapwire_archive::BodyLimits;
use tapwire_net::Limits;

use crate::error::ProxyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub tls: TlsMitmConfig,
    pub archive: ArchiveConfig,
    pub limits: LimitsConfig,
    pub pool: PoolConfig,
    pub resolve_user_agents: bool,
    pub rules_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsMitmConfig {
    pub decrypt: bool,
    pub allow_legacy: bool,
    pub ca_common_name: String,
    pub ca_cert_dir: String,
    pub leaf_cert_dir: String,
    pub leaf_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub directory: String,
    pub body_limits: BodyLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_per_authority: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub race_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            tls: TlsMitmConfig::default(),
            archive: ArchiveConfig::default(),
            limits: LimitsConfig::default(),
            pool: PoolConfig::default(),
            resolve_user_agents: false,
            rules_file: None,
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for TlsMitmConfig {
    fn default() -> Self {
        Self {
            decrypt: true,
            allow_legacy: false,
            ca_common_name: "Tapwire Proxy CA".to_string(),
            ca_cert_dir: "certs".to_string(),
            leaf_cert_dir: "certs/leaf".to_string(),
            leaf_cache_size: 1024,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "archive".to_string(),
            body_limits: BodyLimits::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_header_bytes: limits.max_header_bytes,
            max_body_bytes: limits.max_body_bytes,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_authority: 8,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            race_timeout_ms: 30_000,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ProxyError> {
        toml::from_str(raw).map_err(|err| ProxyError::Config(err.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Limits {
        Limits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::ProxyConfig;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ProxyConfig::from_toml(
            r#"
            resolve_user_agents = true

            [listen]
            port = 9090

            [pool]
            race_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
        assert!(config.resolve_user_agents);
        assert_eq!(config.pool.race_timeout_ms, 500);
        assert_eq!(config.pool.max_idle_per_authority, 8);
        assert!(config.tls.decrypt);
    }

    #[test]
    fn rejects_unknown_types() {
        let error = ProxyConfig::from_toml("[listen]\nport = \"eighty\"").unwrap_err();
        assert!(error.to_string().contains("configuration"));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapwire.toml");
        std::fs::write(&path, "rules_file = \"rules.toml\"\n[archive]\nenabled = true\n").unwrap();
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.rules_file.as_deref(), Some("rules.toml"));
        assert!(config.archive.enabled);
        assert_eq!(config.archive.body_limits.request_max_bytes, 5 * 1024 * 1024);
    }
}
