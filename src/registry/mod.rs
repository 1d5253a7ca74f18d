//! Plugin registry: the durable record of every installed plugin, its
//! manifest, lifecycle status, and current network assignment.
//!
//! The teacher keeps VM bookkeeping in an in-memory `VmStorage` trait
//! (`storage/memory.rs`) with no persistence; this generalizes that
//! trait-plus-impl shape to a single writer-locked JSON file, since the
//! design requires plugin state to survive a host restart.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Installed,
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub slug: String,
    pub manifest: Manifest,
    pub status: PluginStatus,
    pub assigned_ip: Option<Ipv4Addr>,
    pub tap_device: Option<String>,
    /// Outcome of the most recent health probe: `Some("healthy")` on a
    /// passing probe, `Some(<reason>)` on a failing one, `None` before any
    /// probe has run (design §3: Plugin carries "last health result").
    #[serde(default)]
    pub last_health: Option<String>,
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

impl Plugin {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            slug: manifest.slug.clone(),
            manifest,
            status: PluginStatus::Installed,
            assigned_ip: None,
            tap_device: None,
            last_health: None,
            installed_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    plugins: HashMap<String, Plugin>,
}

#[async_trait]
pub trait PluginRegistry: Send + Sync {
    async fn insert(&self, plugin: Plugin) -> Result<()>;
    async fn get(&self, slug: &str) -> Option<Plugin>;
    async fn list(&self) -> Vec<Plugin>;
    async fn set_status(&self, slug: &str, status: PluginStatus) -> Result<()>;
    async fn set_network(
        &self,
        slug: &str,
        ip: Option<Ipv4Addr>,
        tap: Option<String>,
    ) -> Result<()>;
    async fn set_health(&self, slug: &str, result: Option<String>) -> Result<()>;
    async fn remove(&self, slug: &str) -> Result<()>;
}

/// Single-writer-lock JSON-file registry, persisted pretty-printed at
/// `<data>/plugins/plugins.json` (design §6). Every mutating call holds the
/// lock only for the in-memory update plus the file write; it never holds
/// the lock across a VMM or network operation.
pub struct JsonFileRegistry {
    path: PathBuf,
    state: RwLock<RegistryFile>,
}

impl JsonFileRegistry {
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.is_file() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            RegistryFile::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn persist(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(file)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub async fn assigned_ips(&self) -> Vec<Ipv4Addr> {
        self.state
            .read()
            .await
            .plugins
            .values()
            .filter_map(|p| p.assigned_ip)
            .collect()
    }
}

#[async_trait]
impl PluginRegistry for JsonFileRegistry {
    async fn insert(&self, plugin: Plugin) -> Result<()> {
        let mut state = self.state.write().await;
        debug!("registering plugin {}", plugin.slug);
        state.plugins.insert(plugin.slug.clone(), plugin);
        self.persist(&state).await
    }

    async fn get(&self, slug: &str) -> Option<Plugin> {
        self.state.read().await.plugins.get(slug).cloned()
    }

    async fn list(&self) -> Vec<Plugin> {
        self.state.read().await.plugins.values().cloned().collect()
    }

    async fn set_status(&self, slug: &str, status: PluginStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let plugin = state
            .plugins
            .get_mut(slug)
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))?;
        plugin.status = status;
        info!("plugin {slug} status -> {status:?}");
        self.persist(&state).await
    }

    async fn set_network(
        &self,
        slug: &str,
        ip: Option<Ipv4Addr>,
        tap: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let plugin = state
            .plugins
            .get_mut(slug)
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))?;
        plugin.assigned_ip = ip;
        plugin.tap_device = tap;
        self.persist(&state).await
    }

    async fn set_health(&self, slug: &str, result: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        let plugin = state
            .plugins
            .get_mut(slug)
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))?;
        plugin.last_health = result;
        self.persist(&state).await
    }

    async fn remove(&self, slug: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.plugins.remove(slug);
        self.persist(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, Runtime};
    use tempfile::tempdir;

    fn sample_manifest() -> Manifest {
        Manifest {
            slug: "sample-plugin".to_string(),
            name: "Sample Plugin".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            author: None,
            runtime: Some(Runtime::Node),
            actions: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::load(dir.path().join("plugins.json"))
            .await
            .unwrap();

        let plugin = Plugin::new(sample_manifest());
        registry.insert(plugin.clone()).await.unwrap();

        let fetched = registry.get("sample-plugin").await.unwrap();
        assert_eq!(fetched.slug, "sample-plugin");
        assert_eq!(fetched.status, PluginStatus::Installed);
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");

        {
            let registry = JsonFileRegistry::load(path.clone()).await.unwrap();
            registry.insert(Plugin::new(sample_manifest())).await.unwrap();
        }

        let reloaded = JsonFileRegistry::load(path).await.unwrap();
        assert!(reloaded.get("sample-plugin").await.is_some());
    }

    #[tokio::test]
    async fn test_set_status_unknown_plugin_errors() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::load(dir.path().join("plugins.json"))
            .await
            .unwrap();
        assert!(registry
            .set_status("missing", PluginStatus::Active)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_set_network_then_assigned_ips() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::load(dir.path().join("plugins.json"))
            .await
            .unwrap();
        registry.insert(Plugin::new(sample_manifest())).await.unwrap();
        registry
            .set_network(
                "sample-plugin",
                Some(Ipv4Addr::new(192, 168, 127, 5)),
                Some("tap-deadbeef".to_string()),
            )
            .await
            .unwrap();

        let ips = registry.assigned_ips().await;
        assert_eq!(ips, vec![Ipv4Addr::new(192, 168, 127, 5)]);
    }

    #[tokio::test]
    async fn test_set_health_records_probe_result() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::load(dir.path().join("plugins.json"))
            .await
            .unwrap();
        registry.insert(Plugin::new(sample_manifest())).await.unwrap();
        registry
            .set_health("sample-plugin", Some("healthy".to_string()))
            .await
            .unwrap();

        let fetched = registry.get("sample-plugin").await.unwrap();
        assert_eq!(fetched.last_health.as_deref(), Some("healthy"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = JsonFileRegistry::load(dir.path().join("plugins.json"))
            .await
            .unwrap();
        registry.remove("never-existed").await.unwrap();
    }
}
