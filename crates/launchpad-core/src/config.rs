//! Runner configuration, read from a TOML file.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below. Command-line flags override whatever the file sets.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Port of the HTTP front door.
    pub port: u16,
    /// Port of the cold-start proxy.
    pub proxy_port: u16,
    /// Directory holding the autoscale store.
    pub data_dir: PathBuf,
    pub log_level: String,
    pub auth: AuthConfig,
    pub driver: DriverConfig,
    pub autoscale: AutoscaleConfig,
    pub proxy: ProxyConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            port: 4050,
            proxy_port: 4055,
            data_dir: PathBuf::from("/tmp/launchpad"),
            log_level: "info".to_string(),
            auth: AuthConfig::default(),
            driver: DriverConfig::default(),
            autoscale: AutoscaleConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for operator tokens.
    pub secret: String,
    /// HS256 secret for metric reporter tokens.
    pub proxy_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "some-secret".to_string(),
            proxy_secret: "some-proxy-secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Deployment target, e.g. `"istio"`.
    pub driver_type: String,
    /// Kubeconfig path, used when running outside the cluster.
    pub config_file_path: Option<PathBuf>,
    pub in_cluster: bool,
    /// Host that scaled-to-zero traffic is redirected to.
    pub proxy_host: String,
    /// Port that scaled-to-zero traffic is redirected to. Always follows
    /// the runner's `proxy_port`; never read from the file.
    #[serde(skip)]
    pub proxy_port: u16,
    /// Namespace the runner itself lives in.
    pub runner_namespace: String,
    /// Deadline applied to every mesh API call.
    pub mesh_call_timeout_secs: u64,
    /// How long `wait_for_service` watches for a ready replica.
    pub wait_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_type: "istio".to_string(),
            config_file_path: None,
            in_cluster: true,
            proxy_host: "runner.launchpad.svc.cluster.local".to_string(),
            proxy_port: 4055,
            runner_namespace: "launchpad".to_string(),
            mesh_call_timeout_secs: 30,
            wait_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Decision loop period.
    pub interval_secs: u64,
    /// Ingestion workers draining the access channel.
    pub workers: usize,
    /// Access channel capacity; events beyond it are dropped.
    pub channel_capacity: usize,
    /// Idle time after which a zeroed record is forgotten.
    pub idle_ttl_secs: u64,
    pub compaction_interval_secs: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            workers: 10,
            channel_capacity: 10,
            idle_ttl_secs: 300,
            compaction_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Total forwarding attempts for a cold request.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Deadline of a single forwarding attempt.
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 350,
            request_timeout_secs: 60,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RunnerConfig = toml::from_str(&content)?;
        config.link_proxy_port();
        Ok(config)
    }

    /// Point the driver's scale-to-zero redirects at the proxy port.
    pub fn link_proxy_port(&mut self) {
        self.driver.proxy_port = self.proxy_port;
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the embedded autoscale store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("autoscale.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
port = 9000

[autoscale]
interval_secs = 2
"#;
        let config: RunnerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.proxy_port, 4055);
        assert_eq!(config.autoscale.interval_secs, 2);
        assert_eq!(config.autoscale.workers, 10);
        assert_eq!(config.proxy.max_attempts, 5);
        assert_eq!(config.driver.wait_timeout_secs, 180);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        let mut config = RunnerConfig::default();
        config.driver.in_cluster = false;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_proxy_port_from_file_reaches_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "proxy_port = 7005\n\n[driver]\nproxy_port = 9999\n").unwrap();

        let config = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(config.proxy_port, 7005);
        assert_eq!(config.driver.proxy_port, 7005);
    }

    #[test]
    fn test_store_path() {
        let config = RunnerConfig {
            data_dir: PathBuf::from("/var/lib/launchpad"),
            ..Default::default()
        };
        assert_eq!(
            config.store_path(),
            PathBuf::from("/var/lib/launchpad/autoscale.redb")
        );
    }
}
