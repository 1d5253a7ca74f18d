//! VM Supervisor (C2): owns the lifetime of one Firecracker child process per
//! instance id, exposing start/resume/pause/snapshot/stop. Grounded in the
//! teacher's `vm/firecracker.rs` (`tokio::process::Command` child spawning,
//! per-instance UNIX socket path) generalized from a single simulated API
//! call into the full lifecycle the design requires, backed by the raw
//! UDS HTTP client in [`api`].

pub mod api;
pub mod config;

pub use config::VmConfig;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::network::Allocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SnapshotProvenance {
    None,
    Full,
    Differential,
}

/// Ephemeral per-instance state; unique id is the plugin slug in the
/// steady-state design (§3).
pub struct VmEntry {
    child: Child,
    pub control_socket: PathBuf,
    pub ip: Ipv4Addr,
    pub tap: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub state: VmState,
    pub snapshot_provenance: SnapshotProvenance,
}

pub struct VmSupervisor {
    firecracker_binary: String,
    socket_dir: PathBuf,
    instances: Mutex<HashMap<String, VmEntry>>,
}

impl VmSupervisor {
    pub fn new(firecracker_binary: String, socket_dir: PathBuf) -> Self {
        Self {
            firecracker_binary,
            socket_dir,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn socket_path(&self, id: &str) -> PathBuf {
        self.socket_dir.join(format!("{id}.sock"))
    }

    /// Fresh boot. Assembles config, spawns the Firecracker child, configures
    /// it over the control socket, and registers it Running with
    /// `snapshot_provenance = None`.
    pub async fn start(&self, id: &str, config: &VmConfig) -> Result<()> {
        self.boot(id, config, None).await
    }

    /// Same as `start`, but passes the snapshot's memory+state paths so
    /// Firecracker resumes instead of cold-booting.
    pub async fn resume_from_snapshot(
        &self,
        id: &str,
        config: &VmConfig,
        mem_path: &Path,
        state_path: &Path,
    ) -> Result<()> {
        self.boot(id, config, Some((mem_path, state_path))).await
    }

    async fn boot(
        &self,
        id: &str,
        config: &VmConfig,
        snapshot: Option<(&Path, &Path)>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.socket_dir).await?;
        let socket_path = self.socket_path(id);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("spawning firecracker child for instance {id}");
        let child = Command::new(&self.firecracker_binary)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(id)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::Vmm(format!("spawning firecracker for {id}: {e}")))?;

        // Give the API socket a moment to come up before the first request.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let api = api::FirecrackerApi::new(&socket_path);
        let provenance = if let Some((mem_path, state_path)) = snapshot {
            self.configure_resume(&api, config, mem_path, state_path).await?;
            SnapshotProvenance::Full
        } else {
            self.configure_boot(&api, config).await?;
            SnapshotProvenance::None
        };

        let entry = VmEntry {
            child,
            control_socket: socket_path,
            ip: config.ip_address,
            tap: config.tap_device.clone(),
            created_at: Instant::now(),
            last_used: Instant::now(),
            state: VmState::Running,
            snapshot_provenance: provenance,
        };

        self.instances.lock().await.insert(id.to_string(), entry);
        info!("instance {id} running");
        Ok(())
    }

    async fn configure_boot(&self, api: &api::FirecrackerApi<'_>, config: &VmConfig) -> Result<()> {
        api.put_json(
            "/machine-config",
            &serde_json::json!({
                "vcpu_count": config.vcpu_count,
                "mem_size_mib": config.mem_size_mib,
                "track_dirty_pages": config.track_dirty_pages,
            }),
        )
        .await?;

        api.put_json(
            "/boot-source",
            &serde_json::json!({
                "kernel_image_path": config.kernel_path,
                "boot_args": config.kernel_boot_args(),
            }),
        )
        .await?;

        api.put_json(
            "/drives/rootfs",
            &serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": config.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        api.put_json(
            "/network-interfaces/eth0",
            &serde_json::json!({
                "iface_id": "eth0",
                "host_dev_name": config.tap_device,
                "guest_mac": config.guest_mac,
            }),
        )
        .await?;

        api.put_json(
            "/actions",
            &serde_json::json!({ "action_type": "InstanceStart" }),
        )
        .await
    }

    async fn configure_resume(
        &self,
        api: &api::FirecrackerApi<'_>,
        config: &VmConfig,
        mem_path: &Path,
        state_path: &Path,
    ) -> Result<()> {
        api.put_json(
            "/network-interfaces/eth0",
            &serde_json::json!({
                "iface_id": "eth0",
                "host_dev_name": config.tap_device,
                "guest_mac": config.guest_mac,
            }),
        )
        .await?;

        api.put_json(
            "/snapshot/load",
            &serde_json::json!({
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
                "resume_vm": true,
            }),
        )
        .await
    }

    /// Forward to the VMM. Tolerant of calling on an already-paused VM.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let entry = instances
            .get_mut(id)
            .ok_or_else(|| Error::State(format!("unknown instance: {id}")))?;

        if entry.state == VmState::Paused {
            return Ok(());
        }

        let api = api::FirecrackerApi::new(&entry.control_socket);
        api.patch_json("/vm", &serde_json::json!({ "state": "Paused" }))
            .await?;
        entry.state = VmState::Paused;
        Ok(())
    }

    /// Forward to the VMM. Tolerant of calling on an already-running VM —
    /// the shutdown path relies on this.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let entry = instances
            .get_mut(id)
            .ok_or_else(|| Error::State(format!("unknown instance: {id}")))?;

        if entry.state == VmState::Running {
            return Ok(());
        }

        let api = api::FirecrackerApi::new(&entry.control_socket);
        api.patch_json("/vm", &serde_json::json!({ "state": "Resumed" }))
            .await?;
        entry.state = VmState::Running;
        entry.last_used = Instant::now();
        Ok(())
    }

    /// Pause, write `snapshot.mem`/`snapshot.state` (or a differential
    /// `diff-<epoch>` pair) under `dir`, then resume. If the post-snapshot
    /// resume fails, the error is logged but the snapshot is still
    /// considered created.
    pub async fn create_snapshot(&self, id: &str, dir: &Path, differential: bool) -> Result<()> {
        self.pause(id).await?;

        let (mem_name, state_name) = if differential {
            let epoch = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            (format!("diff-{epoch}.mem"), format!("diff-{epoch}.state"))
        } else {
            ("snapshot.mem".to_string(), "snapshot.state".to_string())
        };

        let mem_path = dir.join(&mem_name);
        let state_path = dir.join(&state_name);

        {
            let instances = self.instances.lock().await;
            let entry = instances
                .get(id)
                .ok_or_else(|| Error::State(format!("unknown instance: {id}")))?;
            let api = api::FirecrackerApi::new(&entry.control_socket);
            api.put_json(
                "/snapshot/create",
                &serde_json::json!({
                    "mem_file_path": mem_path,
                    "snapshot_path": state_path,
                    "snapshot_type": if differential { "Diff" } else { "Full" },
                }),
            )
            .await?;
        }

        if let Err(e) = self.resume(id).await {
            warn!("resume after snapshot of {id} failed (snapshot still considered created): {e}");
        } else {
            let mut instances = self.instances.lock().await;
            if let Some(entry) = instances.get_mut(id) {
                entry.snapshot_provenance = if differential {
                    SnapshotProvenance::Differential
                } else {
                    SnapshotProvenance::Full
                };
            }
        }

        Ok(())
    }

    /// Defensively resume (so shutdown signals are deliverable), request
    /// graceful shutdown with a timeout then force-terminate, wait for the
    /// child to exit, and deallocate the IP. Never returns an error; worst
    /// case is a logged force-kill. No-op on an unknown id.
    pub async fn stop(&self, id: &str, allocator: &Allocator) {
        let mut entry = match self.instances.lock().await.remove(id) {
            Some(entry) => entry,
            None => return,
        };

        let api = api::FirecrackerApi::new(&entry.control_socket);
        if entry.state == VmState::Paused {
            if let Err(e) = api
                .patch_json("/vm", &serde_json::json!({ "state": "Resumed" }))
                .await
            {
                debug!("defensive resume before stopping {id} failed (continuing): {e}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // The API call only acknowledges that Firecracker accepted the
        // shutdown request, not that the guest has actually powered off; the
        // graceful-then-force timeout has to bound the child's actual exit,
        // not just this round-trip.
        let request_failed = api
            .put_json(
                "/actions",
                &serde_json::json!({ "action_type": "SendCtrlAltDel" }),
            )
            .await
            .is_err();

        let exited_gracefully = !request_failed
            && timeout(Duration::from_secs(5), entry.child.wait())
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);

        if !exited_gracefully {
            warn!("graceful shutdown of {id} timed out or failed, force-killing");
            if let Err(e) = entry.child.kill().await {
                warn!("force-kill of {id} failed: {e}");
            }
            if let Err(e) = entry.child.wait().await {
                warn!("waiting for {id} to exit after force-kill failed: {e}");
            }
        }

        let _ = tokio::fs::remove_file(&entry.control_socket).await;
        allocator.deallocate_ip(entry.ip);
        info!("instance {id} stopped and reaped");
    }

    pub async fn is_tracked(&self, id: &str) -> bool {
        self.instances.lock().await.contains_key(id)
    }

    pub async fn ip_of(&self, id: &str) -> Option<Ipv4Addr> {
        self.instances.lock().await.get(id).map(|e| e.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_is_per_instance() {
        let supervisor = VmSupervisor::new("firecracker".to_string(), PathBuf::from("/tmp/fc"));
        assert_eq!(
            supervisor.socket_path("hello"),
            PathBuf::from("/tmp/fc/hello.sock")
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_pause_is_an_error() {
        let supervisor = VmSupervisor::new("firecracker".to_string(), PathBuf::from("/tmp/fc"));
        assert!(supervisor.pause("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_unknown_instance_is_noop() {
        let supervisor = VmSupervisor::new("firecracker".to_string(), PathBuf::from("/tmp/fc"));
        let allocator = Allocator::new(crate::config::NetworkConfig::default()).unwrap();
        // Must not panic even though "missing" was never started.
        supervisor.stop("missing", &allocator).await;
    }
}
