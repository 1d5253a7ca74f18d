//! Plugin Lifecycle & Dispatcher (C5): install -> activate -> execute ->
//! deactivate, plus action-hook dispatch across every active plugin.
//!
//! This is the seam where the Allocator, Supervisor, Pre-Warm Pool,
//! Snapshot Store, and Registry come together, mirroring how the teacher's
//! `manager.rs` composes its own VM components into one facade.

pub mod http;

use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::{self, Manifest};
use crate::network::Allocator;
use crate::pool::{PrewarmEntry, PrewarmPool};
use crate::registry::{Plugin, PluginRegistry, PluginStatus};
use crate::snapshot::SnapshotStore;
use crate::vm::{SnapshotProvenance, VmConfig, VmSupervisor};

use self::http::GuestClient;

#[derive(Debug, Serialize)]
pub struct HookOutcome {
    pub plugin_slug: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct DispatchReport {
    pub action_hook: String,
    pub executed_plugins: usize,
    pub results: Vec<HookOutcome>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct Host {
    config: Config,
    registry: Arc<dyn PluginRegistry>,
    allocator: Arc<Allocator>,
    supervisor: Arc<VmSupervisor>,
    pool: Arc<PrewarmPool>,
    snapshots: SnapshotStore,
    guest: GuestClient,
}

impl Host {
    pub fn new(
        config: Config,
        registry: Arc<dyn PluginRegistry>,
        allocator: Arc<Allocator>,
        supervisor: Arc<VmSupervisor>,
        pool: Arc<PrewarmPool>,
    ) -> Self {
        let snapshots = SnapshotStore::new(config.data.snapshot_dir.clone());
        let guest = GuestClient::new(Duration::from_secs(config.pool.dispatch_timeout_seconds));
        Self {
            config,
            registry,
            allocator,
            supervisor,
            pool,
            snapshots,
            guest,
        }
    }

    pub fn pool(&self) -> Arc<PrewarmPool> {
        self.pool.clone()
    }

    pub fn supervisor(&self) -> Arc<VmSupervisor> {
        self.supervisor.clone()
    }

    pub fn allocator(&self) -> Arc<Allocator> {
        self.allocator.clone()
    }

    fn vm_config(&self, slug: &str, tap: String, ip: Ipv4Addr) -> Result<VmConfig> {
        let gateway: Ipv4Addr = self
            .config
            .network
            .gateway
            .parse()
            .map_err(|_| Error::Config("invalid configured gateway".to_string()))?;

        Ok(VmConfig::new(
            self.config.data.rootfs_path(slug),
            PathBuf::from(&self.config.firecracker.kernel_path),
            tap,
            ip,
            gateway,
        ))
    }

    /// Boots a VM for `slug` at `ip`/`tap`, waits the configured settle
    /// delay, then health-gates it. Returns the error on probe failure
    /// without stopping the VM — callers decide the rollback.
    async fn boot_and_health_gate(&self, slug: &str, ip: Ipv4Addr, tap: String) -> Result<()> {
        let vm_config = self.vm_config(slug, tap, ip)?;
        self.supervisor.start(slug, &vm_config).await?;
        self.settle_and_health_gate(slug, ip).await
    }

    /// Same as `boot_and_health_gate`, but resumes `slug` from its existing
    /// snapshot instead of cold-booting it (used when activation finds a
    /// snapshot already on disk and by restore-on-start).
    async fn resume_and_health_gate(&self, slug: &str, ip: Ipv4Addr, tap: String) -> Result<()> {
        let vm_config = self.vm_config(slug, tap, ip)?;
        let mem_path = self.snapshots.mem_path(slug);
        let state_path = self.snapshots.state_path(slug);
        self.supervisor
            .resume_from_snapshot(slug, &vm_config, &mem_path, &state_path)
            .await?;
        self.settle_and_health_gate(slug, ip).await
    }

    async fn settle_and_health_gate(&self, slug: &str, ip: Ipv4Addr) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.config.pool.post_boot_settle_ms)).await;

        let probe = self
            .guest
            .wait_healthy(
                ip,
                self.config.pool.health_probe_retries,
                Duration::from_millis(self.config.pool.health_probe_delay_ms),
            )
            .await;

        let health = match &probe {
            Ok(()) => Some("healthy".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Err(e) = self.registry.set_health(slug, health).await {
            warn!("recording health result for {slug} failed: {e}");
        }

        probe
    }

    /// Startup cleanup: sweeps orphaned TAPs left by a previous crash, and
    /// marks any plugin whose VM artifacts have gone missing as failed
    /// rather than leaving it `active` with nothing backing it.
    pub async fn startup_cleanup(&self) -> Result<()> {
        self.allocator.ensure_bridge().await?;

        let plugins = self.registry.list().await;
        self.allocator
            .load_persisted_assignments(plugins.iter().filter_map(|p| p.assigned_ip.as_ref()));

        let keep: std::collections::HashSet<String> = plugins
            .iter()
            .filter(|p| p.status == PluginStatus::Active)
            .filter_map(|p| p.tap_device.clone())
            .collect();
        self.allocator.orphan_sweep(&keep).await?;

        for plugin in plugins {
            if plugin.status == PluginStatus::Active {
                warn!("restoring active plugin {} after restart", plugin.slug);
                if let Err(e) = self.restore_active(&plugin).await {
                    warn!(
                        "plugin {} failed to restore cleanly, marking failed: {e}",
                        plugin.slug
                    );
                    self.registry
                        .set_status(&plugin.slug, PluginStatus::Failed)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Restore-on-start: boot fresh, health-probe, take a fresh snapshot
    /// (an old one is not trusted across a restart), pause, and add to the
    /// pool before any dispatch is served.
    async fn restore_active(&self, plugin: &Plugin) -> Result<()> {
        let ip = plugin
            .assigned_ip
            .ok_or_else(|| Error::State(format!("active plugin {} has no assigned IP", plugin.slug)))?;
        let tap = plugin
            .tap_device
            .clone()
            .unwrap_or_else(|| self.allocator.tap_name_for(&plugin.slug));

        self.allocator.ensure_tap(&tap).await?;
        if let Err(e) = self
            .boot_and_health_gate(&plugin.slug, ip, tap.clone())
            .await
        {
            warn!(
                "plugin {} failed health probe during restore, tearing it down: {e}",
                plugin.slug
            );
            self.supervisor.stop(&plugin.slug, &self.allocator).await;
            return Err(e);
        }

        if let Err(e) = self.activate_snapshot_and_pause(&plugin.slug).await {
            warn!(
                "plugin {} failed snapshot/pause during restore, tearing it down: {e}",
                plugin.slug
            );
            self.supervisor.stop(&plugin.slug, &self.allocator).await;
            return Err(e);
        }

        self.pool
            .insert(
                &plugin.slug,
                PrewarmEntry {
                    instance_id: plugin.slug.clone(),
                    ip,
                    tap,
                    created_at: Instant::now(),
                    last_used_at: Instant::now(),
                    snapshot_provenance: SnapshotProvenance::Full,
                },
                &self.supervisor,
                &self.allocator,
            )
            .await;

        Ok(())
    }

    /// Install: extracts the package, validates the manifest, boots the VM
    /// once to health-gate it, then tears it down — install never leaves a
    /// VM running. On a health-probe failure, allocations are rolled back
    /// and the plugin is recorded as `failed`.
    pub async fn install(&self, zip_path: &PathBuf) -> Result<Manifest> {
        tokio::fs::create_dir_all(self.config.data.plugins_dir()).await?;

        let scratch_rootfs =
            std::env::temp_dir().join(format!("plugin-rootfs-{}.ext4", uuid::Uuid::new_v4()));
        let scratch_manifest =
            std::env::temp_dir().join(format!("plugin-manifest-{}.json", uuid::Uuid::new_v4()));

        let manifest = manifest::extract_package(zip_path, &scratch_rootfs, &scratch_manifest)?;
        let slug = manifest.slug.clone();

        // Reinstalling over a plugin that still holds resources tears them
        // down first (design §4.5: upload on a known slug with prior state).
        if let Some(prior) = self.registry.get(&slug).await {
            if prior.status != PluginStatus::Installed {
                self.teardown_resources(&slug).await;
            }
        }

        let rootfs_dest = self.config.data.rootfs_path(&slug);
        let manifest_dest = self.config.data.plugins_dir().join(format!("{slug}.json"));
        tokio::fs::rename(&scratch_rootfs, &rootfs_dest).await?;
        tokio::fs::rename(&scratch_manifest, &manifest_dest).await?;

        self.registry.insert(Plugin::new(manifest.clone())).await?;

        let ip = self.allocator.allocate_ip()?;
        let tap = self.allocator.tap_name_for(&slug);
        self.allocator.ensure_tap(&tap).await?;

        if let Err(e) = self.boot_and_health_gate(&slug, ip, tap.clone()).await {
            warn!("plugin {slug} failed install health probe, rolling back: {e}");
            self.supervisor.stop(&slug, &self.allocator).await;
            self.allocator.delete_tap(&tap).await;
            self.registry.set_status(&slug, PluginStatus::Failed).await?;
            return Err(e);
        }

        self.supervisor.stop(&slug, &self.allocator).await;

        self.registry.set_network(&slug, Some(ip), Some(tap)).await?;
        self.registry.set_status(&slug, PluginStatus::Installed).await?;
        info!("installed plugin {slug}");
        Ok(manifest)
    }

    /// Activate: no-op if already active. If a snapshot already exists
    /// (e.g. a prior activation left one in place with no pool entry, such
    /// as after a crash), resumes it, health-gates it, and pools it before
    /// committing `active`. Otherwise boots fresh, health-gates, snapshots,
    /// pauses into the pool, then commits `active`.
    pub async fn activate(&self, slug: &str) -> Result<()> {
        let plugin = self
            .registry
            .get(slug)
            .await
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))?;

        if plugin.status == PluginStatus::Active {
            return Ok(());
        }

        if self.snapshots.exists(slug) {
            // A snapshot on disk with no pool entry means a prior activation
            // (or this process's restore-on-start) already did the work of
            // booting and snapshotting; resume it into the pool rather than
            // flipping status with nothing backing it (an active plugin
            // must always have a pool entry, per design §8 invariant 3).
            let ip = plugin.assigned_ip.ok_or_else(|| {
                Error::State(format!("plugin {slug} has a snapshot but no assigned IP"))
            })?;
            let tap = plugin
                .tap_device
                .clone()
                .unwrap_or_else(|| self.allocator.tap_name_for(slug));
            self.allocator.ensure_tap(&tap).await?;

            if let Err(e) = self.resume_and_health_gate(slug, ip, tap.clone()).await {
                warn!("plugin {slug} failed to resume from existing snapshot, rolling back: {e}");
                self.supervisor.stop(slug, &self.allocator).await;
                return Err(e);
            }
            if let Err(e) = self.supervisor.pause(slug).await {
                warn!("pausing {slug} after snapshot resume failed, tearing it down: {e}");
                self.supervisor.stop(slug, &self.allocator).await;
                return Err(e);
            }

            self.pool
                .insert(
                    slug,
                    PrewarmEntry {
                        instance_id: slug.to_string(),
                        ip,
                        tap,
                        created_at: Instant::now(),
                        last_used_at: Instant::now(),
                        snapshot_provenance: SnapshotProvenance::Full,
                    },
                    &self.supervisor,
                    &self.allocator,
                )
                .await;

            self.registry.set_status(slug, PluginStatus::Active).await?;
            info!("plugin {slug} activated from existing snapshot");
            return Ok(());
        }

        let ip = match plugin.assigned_ip {
            Some(ip) => ip,
            None => self.allocator.allocate_ip()?,
        };
        let tap = plugin
            .tap_device
            .clone()
            .unwrap_or_else(|| self.allocator.tap_name_for(slug));
        self.allocator.ensure_tap(&tap).await?;

        if let Err(e) = self.boot_and_health_gate(slug, ip, tap.clone()).await {
            warn!("plugin {slug} failed activation health probe, rolling back: {e}");
            self.supervisor.stop(slug, &self.allocator).await;
            if plugin.assigned_ip.is_none() {
                self.allocator.deallocate_ip(ip);
            }
            return Err(e);
        }

        // Any failure from here until pool insertion rolls back the VM and
        // any allocation this call itself made (design §4.5: activate).
        if let Err(e) = self.activate_snapshot_and_pause(slug).await {
            warn!("plugin {slug} failed snapshot/pause during activation, rolling back: {e}");
            self.supervisor.stop(slug, &self.allocator).await;
            self.allocator.delete_tap(&tap).await;
            if plugin.assigned_ip.is_none() {
                self.allocator.deallocate_ip(ip);
            }
            return Err(e);
        }

        self.pool
            .insert(
                slug,
                PrewarmEntry {
                    instance_id: slug.to_string(),
                    ip,
                    tap: tap.clone(),
                    created_at: Instant::now(),
                    last_used_at: Instant::now(),
                    snapshot_provenance: SnapshotProvenance::Full,
                },
                &self.supervisor,
                &self.allocator,
            )
            .await;

        self.registry.set_network(slug, Some(ip), Some(tap)).await?;
        self.registry.set_status(slug, PluginStatus::Active).await?;
        info!("plugin {slug} activated");
        Ok(())
    }

    async fn activate_snapshot_and_pause(&self, slug: &str) -> Result<()> {
        let snapshot_dir = self.snapshots.prepare_dir(slug).await?;
        self.supervisor
            .create_snapshot(slug, &snapshot_dir, false)
            .await?;
        self.supervisor.pause(slug).await
    }

    /// Tears down whatever resources a plugin currently holds: pool entry,
    /// running VM, snapshot. Used by reinstall and delete; errors are
    /// logged, never propagated, since the caller's own operation must
    /// still proceed.
    async fn teardown_resources(&self, slug: &str) {
        if let Some(entry) = self.pool.try_lease(slug) {
            self.supervisor.stop(slug, &self.allocator).await;
            self.allocator.delete_tap(&entry.tap).await;
        } else {
            self.supervisor.stop(slug, &self.allocator).await;
        }
        if let Err(e) = self.snapshots.delete(slug).await {
            warn!("deleting snapshot for {slug} during teardown failed: {e}");
        }
    }

    /// Deactivate: removes the pool entry (stopping its VM), deletes the
    /// snapshot, clears `AssignedIP`/`TapDevice` immediately, and commits
    /// `inactive`. A later `activate` always allocates fresh.
    pub async fn deactivate(&self, slug: &str) -> Result<()> {
        self.registry
            .get(slug)
            .await
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))?;

        self.teardown_resources(slug).await;

        self.registry.set_network(slug, None, None).await?;
        self.registry.set_status(slug, PluginStatus::Inactive).await?;
        info!("plugin {slug} deactivated");
        Ok(())
    }

    pub async fn delete(&self, slug: &str) -> Result<()> {
        if self.registry.get(slug).await.is_some() {
            self.teardown_resources(slug).await;
        }
        self.registry.remove(slug).await?;
        info!("plugin {slug} deleted");
        Ok(())
    }

    /// Dispatches `hook` with `payload` to every active plugin that
    /// declares an action subscribed to it, highest declared priority
    /// first. A plugin with no pool entry available contributes a failure
    /// outcome; it never fails the whole call.
    pub async fn execute(&self, hook: &str, payload: &Value) -> Result<DispatchReport> {
        let mut targets: Vec<(String, crate::manifest::Action)> = Vec::new();
        for plugin in self.registry.list().await {
            if plugin.status != PluginStatus::Active {
                continue;
            }
            for action in plugin.manifest.actions_for_hook(hook) {
                targets.push((plugin.slug.clone(), action.clone()));
            }
        }
        targets.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let mut results = Vec::with_capacity(targets.len());
        for (slug, action) in targets {
            let started = Instant::now();
            let outcome = match self.dispatch_one(&slug, &action, hook, payload).await {
                Ok(output) => HookOutcome {
                    plugin_slug: slug,
                    success: true,
                    result: Some(output),
                    error: None,
                    execution_time_ms: started.elapsed().as_millis(),
                },
                Err(e) => {
                    warn!("hook {hook} failed for plugin: {e}");
                    HookOutcome {
                        plugin_slug: slug,
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                        execution_time_ms: started.elapsed().as_millis(),
                    }
                }
            };
            results.push(outcome);
        }

        Ok(DispatchReport {
            action_hook: hook.to_string(),
            executed_plugins: results.len(),
            results,
            timestamp: chrono::Utc::now(),
        })
    }

    async fn dispatch_one(
        &self,
        slug: &str,
        action: &crate::manifest::Action,
        hook: &str,
        payload: &Value,
    ) -> Result<Value> {
        let entry = self
            .pool
            .try_lease(slug)
            .ok_or_else(|| crate::pool::no_pool_entry(slug))?;

        // The entry is out of the pool map for the rest of this call (design
        // §5: a lease is never visible in two places). A failed resume must
        // tear the instance down rather than strand it untracked by both the
        // pool and a future lease.
        if let Err(e) = self.supervisor.resume(slug).await {
            warn!("resuming {slug} for dispatch failed, tearing it down: {e}");
            self.supervisor.stop(slug, &self.allocator).await;
            self.allocator.delete_tap(&entry.tap).await;
            return Err(e);
        }

        let result = self
            .guest
            .call_hook(entry.ip, &action.method, &action.endpoint, hook, payload)
            .await;

        // Every pool entry must refer to a Paused VM (design §3/§5); a
        // failed re-pause must not re-enter the pool looking healthy.
        if let Err(e) = self.supervisor.pause(slug).await {
            warn!("re-pausing {slug} after dispatch failed, tearing it down: {e}");
            self.supervisor.stop(slug, &self.allocator).await;
            self.allocator.delete_tap(&entry.tap).await;
        } else {
            self.pool
                .give_back(slug, entry, &self.supervisor, &self.allocator)
                .await;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_report_counts_match_results() {
        let report = DispatchReport {
            action_hook: "on-commit".to_string(),
            executed_plugins: 1,
            results: vec![HookOutcome {
                plugin_slug: "sample".to_string(),
                success: true,
                result: Some(Value::Null),
                error: None,
                execution_time_ms: 5,
            }],
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(report.executed_plugins, report.results.len());
    }
}
