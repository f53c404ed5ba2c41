use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "BENCHLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "benchlink.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct BenchConfig {
    pub discovery: DiscoveryConf,
    pub worker: WorkerConf,
    pub registry: RegistryConf,
    pub events: EventsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DiscoveryConf {
    pub group: IpAddr, // groupe multicast écouté par les appareils
    pub port: u16,
    pub bind_addr: IpAddr,
    pub timeout_ms: u64,
    pub multicast_ttl: u32,
    pub buffer_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerConf {
    pub bind_addr: IpAddr,
    pub recv_timeout_ms: u64, // borne aussi la latence d'un stop
    pub buffer_size: usize,
}

/// Plafonds optionnels par appareil ; None = croissance sans limite
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RegistryConf {
    pub max_log_lines: Option<usize>,
    pub max_samples: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EventsConf {
    pub capacity: usize,
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            group: IpAddr::V4(Ipv4Addr::new(224, 3, 11, 15)),
            port: 31115,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            timeout_ms: 2000,
            multicast_ttl: 1,
            buffer_size: 1024,
        }
    }
}

impl Default for WorkerConf {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            recv_timeout_ms: 2000,
            buffer_size: 1024,
        }
    }
}

impl Default for EventsConf {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl DiscoveryConf {
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WorkerConf {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl BenchConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }
}

/// Charge `.env` puis le YAML pointé par BENCHLINK_CONFIG (défaut benchlink.yaml).
/// Fichier absent, illisible ou invalide : config par défaut, jamais d'échec.
pub async fn load_config() -> BenchConfig {
    dotenvy::dotenv().ok();
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> BenchConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return BenchConfig::default();
    }

    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
            return BenchConfig::default();
        }
    };
    BenchConfig::from_yaml(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        BenchConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_firmware() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.discovery.target().to_string(), "224.3.11.15:31115");
        assert_eq!(cfg.worker.recv_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.registry.max_samples, None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = BenchConfig::from_yaml("worker:\n  recv_timeout_ms: 250\nregistry:\n  max_samples: 100\n").unwrap();
        assert_eq!(cfg.worker.recv_timeout_ms, 250);
        assert_eq!(cfg.worker.buffer_size, 1024);
        assert_eq!(cfg.registry.max_samples, Some(100));
        assert_eq!(cfg.discovery.port, 31115);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(BenchConfig::from_yaml("  \n").unwrap(), BenchConfig::default());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "discovery:\n  group: 127.0.0.1\n  port: 40000\n  timeout_ms: 300").unwrap();

        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.discovery.target().to_string(), "127.0.0.1:40000");
        assert_eq!(cfg.discovery.timeout(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_invalid_or_missing_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker: [not, a, map]").unwrap();
        assert_eq!(load_config_from(file.path()).await, BenchConfig::default());

        let cfg = load_config_from("/nonexistent/benchlink.yaml").await;
        assert_eq!(cfg, BenchConfig::default());
    }

    #[tokio::test]
    async fn test_unreadable_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Latin-1 pur : pas de l'UTF-8 valide
        file.write_all(b"worker:\n  recv_timeout_ms: 250 # \xe9\xff\n").unwrap();

        assert_eq!(load_config_from(file.path()).await, BenchConfig::default());
    }
}
