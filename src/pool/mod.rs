//! Pre-Warm Pool (C4): one paused, booted VM cached per plugin, leased out
//! to the dispatcher and either returned or torn down.
//!
//! Keeps the teacher's `DashMap`-backed pool idiom from the original
//! `VmPoolManager`, generalized from a pool-per-VM-type free list down to
//! the design's single-entry-per-plugin cache with an age-based expiry
//! sweeper.

pub mod maintenance;

use dashmap::DashMap;
use log::debug;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::network::Allocator;
use crate::vm::{SnapshotProvenance, VmSupervisor};

/// A paused, booted VM held in reserve for one plugin.
pub struct PrewarmEntry {
    pub instance_id: String,
    pub ip: Ipv4Addr,
    pub tap: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub snapshot_provenance: SnapshotProvenance,
}

/// Pre-Warm Pool: at most one entry per plugin slug. Entries are removed
/// from the map for the duration of a lease; the `Supervisor` operation a
/// lease triggers (resume) always runs outside the map lock (design §5).
pub struct PrewarmPool {
    entries: DashMap<String, PrewarmEntry>,
    max_age: Duration,
}

impl PrewarmPool {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
        }
    }

    /// Inserts a freshly paused VM into the pool for `slug`. If an entry is
    /// already cached there, it is stopped through the Supervisor first
    /// (design §4.4: an excess entry is stopped via C2) rather than dropped.
    pub async fn insert(
        &self,
        slug: &str,
        entry: PrewarmEntry,
        supervisor: &VmSupervisor,
        allocator: &Allocator,
    ) {
        self.evict(slug, supervisor, allocator).await;
        self.entries.insert(slug.to_string(), entry);
    }

    /// Removes and returns the cached entry for `slug`, if any. The caller
    /// is responsible for resuming it and, on any failure, for cleaning up
    /// through the Supervisor rather than re-inserting it here.
    pub fn try_lease(&self, slug: &str) -> Option<PrewarmEntry> {
        self.entries.remove(slug).map(|(_, entry)| entry)
    }

    /// Returns a leased entry to the pool after the caller is done with it
    /// (only meaningful once dispatch re-pauses it). Stops any entry already
    /// occupying `slug` first, same as `insert`.
    pub async fn give_back(
        &self,
        slug: &str,
        mut entry: PrewarmEntry,
        supervisor: &VmSupervisor,
        allocator: &Allocator,
    ) {
        entry.last_used_at = Instant::now();
        self.evict(slug, supervisor, allocator).await;
        self.entries.insert(slug.to_string(), entry);
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.entries.contains_key(slug)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expired_slugs(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| now.duration_since(e.created_at) > self.max_age)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Tears down every entry older than `max_age` through the Supervisor,
    /// freeing its IP/TAP. Intended to run on a fixed tick (design default:
    /// 30s) from [`maintenance::spawn_sweeper`].
    pub async fn sweep_expired(&self, supervisor: &VmSupervisor, allocator: &Allocator) {
        for slug in self.expired_slugs() {
            if let Some((_, entry)) = self.entries.remove(&slug) {
                debug!("pool entry for {slug} exceeded max age, retiring");
                supervisor.stop(&entry.instance_id, allocator).await;
                allocator.delete_tap(&entry.tap).await;
            }
        }
    }

    /// Stops and releases the TAP of whatever entry currently occupies
    /// `slug`, if any. Used by `insert`/`give_back` so a displaced entry is
    /// torn down through the Supervisor rather than silently dropped
    /// (design §4.4: an excess entry is stopped via C2).
    async fn evict(&self, slug: &str, supervisor: &VmSupervisor, allocator: &Allocator) {
        if let Some((_, entry)) = self.entries.remove(slug) {
            debug!("evicting displaced pool entry for {slug}");
            supervisor.stop(&entry.instance_id, allocator).await;
            allocator.delete_tap(&entry.tap).await;
        }
    }
}

impl Default for PrewarmPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

/// Errors a lease can fail with, wrapped into [`crate::error::Error`] by
/// the dispatcher.
pub fn no_pool_entry(slug: &str) -> Error {
    Error::NoAvailableVm(slug.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn sample_entry(id: &str) -> PrewarmEntry {
        PrewarmEntry {
            instance_id: id.to_string(),
            ip: "192.168.127.2".parse().unwrap(),
            tap: "tap-deadbeef".to_string(),
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            snapshot_provenance: SnapshotProvenance::Full,
        }
    }

    fn test_fixtures() -> (VmSupervisor, Allocator) {
        let supervisor = VmSupervisor::new("firecracker".to_string(), "/tmp/fc".into());
        let allocator = Allocator::new(NetworkConfig::default()).unwrap();
        (supervisor, allocator)
    }

    #[tokio::test]
    async fn test_insert_then_lease_removes_entry() {
        let pool = PrewarmPool::default();
        let (supervisor, allocator) = test_fixtures();
        pool.insert("plugin-a", sample_entry("vm-1"), &supervisor, &allocator)
            .await;
        assert!(pool.contains("plugin-a"));

        let leased = pool.try_lease("plugin-a").unwrap();
        assert_eq!(leased.instance_id, "vm-1");
        assert!(!pool.contains("plugin-a"));
    }

    #[test]
    fn test_lease_missing_slug_returns_none() {
        let pool = PrewarmPool::default();
        assert!(pool.try_lease("missing").is_none());
    }

    #[tokio::test]
    async fn test_give_back_reinserts_and_bumps_last_used() {
        let pool = PrewarmPool::default();
        let (supervisor, allocator) = test_fixtures();
        let entry = sample_entry("vm-1");
        let original_last_used = entry.last_used_at;
        pool.give_back("plugin-a", entry, &supervisor, &allocator)
            .await;

        assert!(pool.contains("plugin-a"));
        let reinserted = pool.try_lease("plugin-a").unwrap();
        assert!(reinserted.last_used_at >= original_last_used);
    }

    #[tokio::test]
    async fn test_insert_displacing_existing_entry_stops_it() {
        let pool = PrewarmPool::default();
        let (supervisor, allocator) = test_fixtures();
        pool.insert("plugin-a", sample_entry("vm-1"), &supervisor, &allocator)
            .await;
        pool.insert("plugin-a", sample_entry("vm-2"), &supervisor, &allocator)
            .await;

        assert!(pool.contains("plugin-a"));
        let leased = pool.try_lease("plugin-a").unwrap();
        assert_eq!(leased.instance_id, "vm-2");
    }

    #[tokio::test]
    async fn test_expired_slugs_empty_when_fresh() {
        let pool = PrewarmPool::new(Duration::from_secs(600));
        let (supervisor, allocator) = test_fixtures();
        pool.insert("plugin-a", sample_entry("vm-1"), &supervisor, &allocator)
            .await;
        assert!(pool.expired_slugs().is_empty());
    }

    #[tokio::test]
    async fn test_expired_slugs_flags_old_entries() {
        let pool = PrewarmPool::new(Duration::from_millis(0));
        let (supervisor, allocator) = test_fixtures();
        pool.insert("plugin-a", sample_entry("vm-1"), &supervisor, &allocator)
            .await;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.expired_slugs(), vec!["plugin-a".to_string()]);
    }
}
