use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Error, Result};

/// Application configuration for the plugin host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub firecracker: FirecrackerConfig,
    pub network: NetworkConfig,
    pub data: DataConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
    /// Deployment mode; affects only logging verbosity and cleanup
    /// aggressiveness, never lifecycle semantics.
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    Production,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Path to the firecracker binary.
    pub binary_path: String,
    /// Path to the guest kernel image.
    pub kernel_path: String,
    /// Directory holding per-instance UNIX control sockets.
    pub socket_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host bridge name (e.g. `fc-br`).
    pub bridge_name: String,
    /// Gateway address, e.g. `192.168.127.1`.
    pub gateway: String,
    /// Subnet prefix length (the design fixes a /24).
    pub prefix_len: u8,
    /// Fixed vendor-local MAC prefix used for every guest vNIC.
    pub mac_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "fc-br".to_string(),
            gateway: "192.168.127.1".to_string(),
            prefix_len: 24,
            mac_prefix: "AA:FC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory (`<data>` throughout the design).
    pub data_dir: PathBuf,
    /// Snapshot root, defaults to `<data>/snapshots`.
    pub snapshot_dir: PathBuf,
}

impl DataConfig {
    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir.join("plugins")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.plugins_dir().join("plugins.json")
    }

    pub fn rootfs_path(&self, slug: &str) -> PathBuf {
        self.plugins_dir().join(format!("{slug}.ext4"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pre-warm pool size per plugin (design default: 1).
    pub size_per_plugin: usize,
    /// Max age of a prewarmed VM before the sweeper retires it.
    pub max_age_seconds: u64,
    /// Sweep interval.
    pub sweep_interval_seconds: u64,
    /// Health probe retry count.
    pub health_probe_retries: u32,
    /// Health probe delay between attempts, in milliseconds.
    pub health_probe_delay_ms: u64,
    /// Post-boot settle time before the first probe, in milliseconds.
    pub post_boot_settle_ms: u64,
    /// HTTP timeout for action-hook dispatch, in seconds.
    pub dispatch_timeout_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_per_plugin: 1,
            max_age_seconds: 600,
            sweep_interval_seconds: 30,
            health_probe_retries: 30,
            health_probe_delay_ms: 500,
            post_boot_settle_ms: 3000,
            dispatch_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            firecracker: FirecrackerConfig {
                binary_path: "/usr/bin/firecracker".to_string(),
                kernel_path: "/var/lib/plugin-vmhost/vmlinux".to_string(),
                socket_dir: PathBuf::from("/tmp/plugin-vmhost/sockets"),
            },
            network: NetworkConfig::default(),
            data: DataConfig {
                data_dir: PathBuf::from("/var/lib/plugin-vmhost"),
                snapshot_dir: PathBuf::from("/var/lib/plugin-vmhost/snapshots"),
            },
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
            mode: Mode::Production,
        }
    }
}

impl Config {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.size_per_plugin == 0 {
            return Err(Error::Config(
                "pool.size_per_plugin must be at least 1".to_string(),
            ));
        }
        if self.network.prefix_len != 24 {
            return Err(Error::Config(
                "network.prefix_len: only /24 subnets are supported by the design".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.pool.size_per_plugin, 1);
        assert_eq!(config.network.gateway, "192.168.127.1");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_save_load_roundtrip() {
        let config = Config::default();
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        config.save_to_file(&path).await.unwrap();
        let loaded = Config::load_from_file(&path).await.unwrap();

        assert_eq!(config.network.bridge_name, loaded.network.bridge_name);
        assert_eq!(config.pool.size_per_plugin, loaded.pool.size_per_plugin);
    }

    #[test]
    fn test_config_validation_rejects_zero_pool_size() {
        let mut config = Config::default();
        config.pool.size_per_plugin = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_non_24_prefix() {
        let mut config = Config::default();
        config.network.prefix_len = 16;
        assert!(config.validate().is_err());
    }
}
