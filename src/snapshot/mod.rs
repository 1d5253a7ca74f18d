//! Snapshot Store (C3): on-disk snapshot bundles, one directory per plugin.
//!
//! Grounded in the golden-snapshot directory layout from the pack's
//! `NexusQuantum-NQRust-MicroVM` snapshot feature: a fixed `snapshot.mem`/
//! `snapshot.state` pair for the full snapshot plus timestamped
//! `diff-<epoch>.mem`/`diff-<epoch>.state` pairs for differential ones,
//! all addressed purely by plugin slug rather than a database.

use std::path::PathBuf;

use crate::error::Result;

const FULL_MEM: &str = "snapshot.mem";
const FULL_STATE: &str = "snapshot.state";

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn dir_for(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    pub fn mem_path(&self, slug: &str) -> PathBuf {
        self.dir_for(slug).join(FULL_MEM)
    }

    pub fn state_path(&self, slug: &str) -> PathBuf {
        self.dir_for(slug).join(FULL_STATE)
    }

    /// Ensures `<data>/snapshots/<slug>/` exists, returning it for
    /// `VmSupervisor::create_snapshot` to write into.
    pub async fn prepare_dir(&self, slug: &str) -> Result<PathBuf> {
        let dir = self.dir_for(slug);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// True iff both base files are present and non-empty (design §3: a
    /// zero-byte file left by a crashed write does not count as a snapshot).
    pub fn exists(&self, slug: &str) -> bool {
        is_nonempty_file(&self.mem_path(slug)) && is_nonempty_file(&self.state_path(slug))
    }

    pub async fn delete(&self, slug: &str) -> Result<()> {
        let dir = self.dir_for(slug);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Lists the differential snapshots present for `slug`, oldest first,
    /// by parsing the epoch out of `diff-<epoch>.mem` filenames.
    pub async fn list_differentials(&self, slug: &str) -> Result<Vec<u64>> {
        let dir = self.dir_for(slug);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(epoch) = parse_diff_epoch(&entry.file_name().to_string_lossy()) {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn diff_mem_path(&self, slug: &str, epoch: u64) -> PathBuf {
        self.dir_for(slug).join(format!("diff-{epoch}.mem"))
    }

    pub fn diff_state_path(&self, slug: &str, epoch: u64) -> PathBuf {
        self.dir_for(slug).join(format!("diff-{epoch}.state"))
    }
}

fn is_nonempty_file(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn parse_diff_epoch(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("diff-")?
        .strip_suffix(".mem")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prepare_dir_creates_and_exists_is_false_until_files_written() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        let dir = store.prepare_dir("my-plugin").await.unwrap();
        assert!(dir.is_dir());
        assert!(!store.exists("my-plugin"));
    }

    #[tokio::test]
    async fn test_exists_true_after_both_files_present() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        store.prepare_dir("my-plugin").await.unwrap();
        tokio::fs::write(store.mem_path("my-plugin"), b"mem").await.unwrap();
        tokio::fs::write(store.state_path("my-plugin"), b"state").await.unwrap();
        assert!(store.exists("my-plugin"));
    }

    #[tokio::test]
    async fn test_exists_false_when_files_present_but_empty() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        store.prepare_dir("my-plugin").await.unwrap();
        tokio::fs::write(store.mem_path("my-plugin"), b"").await.unwrap();
        tokio::fs::write(store.state_path("my-plugin"), b"state").await.unwrap();
        assert!(!store.exists("my-plugin"));
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        store.prepare_dir("my-plugin").await.unwrap();
        store.delete("my-plugin").await.unwrap();
        assert!(!store.dir_for("my-plugin").exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_plugin_is_noop() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        store.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_differentials_sorted_oldest_first() {
        let root = tempdir().unwrap();
        let store = SnapshotStore::new(root.path().to_path_buf());
        store.prepare_dir("my-plugin").await.unwrap();
        tokio::fs::write(store.diff_mem_path("my-plugin", 200), b"m").await.unwrap();
        tokio::fs::write(store.diff_mem_path("my-plugin", 100), b"m").await.unwrap();

        let epochs = store.list_differentials("my-plugin").await.unwrap();
        assert_eq!(epochs, vec![100, 200]);
    }

    #[test]
    fn test_parse_diff_epoch() {
        assert_eq!(parse_diff_epoch("diff-12345.mem"), Some(12345));
        assert_eq!(parse_diff_epoch("snapshot.mem"), None);
    }
}
