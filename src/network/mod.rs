//! Host-Network Allocator (C1): TAP + IPv4 allocation on a fixed /24,
//! bridge membership, and orphan sweeping.
//!
//! Grounded in the teacher's `vm/firecracker.rs` (tokio::process::Command
//! child-process idiom) and the networking helpers found across the pack's
//! Firecracker-adjacent examples (`lambdo`'s `vm_manager/vmm/net.rs`,
//! `cthulu`'s `sandbox/firecracker/net.rs`): host networking is driven with
//! plain `ip`/`brctl` invocations rather than a netlink crate, and
//! "already exists" is treated as success.

use log::{debug, info, warn};
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tokio::process::Command;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

const TAP_PREFIX: &str = "tap-";

/// Deterministic TAP device name for a plugin slug: `tap-` followed by the
/// first 8 hex characters of MD5(slug). Always 12 characters, well inside
/// the kernel's 15-character interface name limit.
pub fn tap_name_for(slug: &str) -> String {
    let digest = Md5::digest(slug.as_bytes());
    let hex = format!("{digest:x}");
    format!("{TAP_PREFIX}{}", &hex[..8])
}

/// A single /24 IPv4 pool: `.1` is the gateway, `.2..254` are assignable,
/// `.0`/`.255` are reserved.
struct IpPoolInner {
    base: [u8; 3],
    marked: HashSet<u8>,
    cursor: u8,
}

impl IpPoolInner {
    fn new(gateway: Ipv4Addr) -> Self {
        let octets = gateway.octets();
        Self {
            base: [octets[0], octets[1], octets[2]],
            marked: HashSet::new(),
            cursor: 2,
        }
    }

    fn addr(&self, last: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.base[0], self.base[1], self.base[2], last)
    }

    fn allocate(&mut self) -> Result<Ipv4Addr> {
        let start = self.cursor;
        loop {
            let candidate = self.cursor;
            self.cursor = if self.cursor >= 254 { 2 } else { self.cursor + 1 };

            if candidate >= 2 && candidate <= 254 && !self.marked.contains(&candidate) {
                self.marked.insert(candidate);
                return Ok(self.addr(candidate));
            }

            if self.cursor == start {
                return Err(Error::PoolExhausted);
            }
        }
    }

    fn deallocate(&mut self, addr: Ipv4Addr) {
        let octets = addr.octets();
        if octets[0] == self.base[0] && octets[1] == self.base[1] && octets[2] == self.base[2] {
            self.marked.remove(&octets[3]);
        }
    }

    fn mark(&mut self, addr: Ipv4Addr) {
        let octets = addr.octets();
        if octets[0] == self.base[0] && octets[1] == self.base[1] && octets[2] == self.base[2] {
            self.marked.insert(octets[3]);
        }
    }
}

/// Host-Network Allocator. Owns IP allocation state; TAP/bridge existence is
/// queried lazily from the kernel rather than cached, since the design treats
/// the TAP registry as derived state.
pub struct Allocator {
    ip_pool: Mutex<IpPoolInner>,
    network: NetworkConfig,
}

impl Allocator {
    pub fn new(network: NetworkConfig) -> Result<Self> {
        let gateway: Ipv4Addr = network
            .gateway
            .parse()
            .map_err(|_| Error::Config(format!("invalid gateway address: {}", network.gateway)))?;
        Ok(Self {
            ip_pool: Mutex::new(IpPoolInner::new(gateway)),
            network,
        })
    }

    /// Reserve the first unmarked address, advancing the cursor with wrap-around.
    pub fn allocate_ip(&self) -> Result<Ipv4Addr> {
        let mut pool = self.ip_pool.lock().unwrap();
        pool.allocate()
    }

    /// Unmark an address; idempotent on unknown addresses.
    pub fn deallocate_ip(&self, addr: Ipv4Addr) {
        let mut pool = self.ip_pool.lock().unwrap();
        pool.deallocate(addr);
    }

    /// Mark every address already assigned to a plugin in the registry, so
    /// re-activation reuses the same address rather than colliding with it.
    pub fn load_persisted_assignments<'a>(&self, assigned: impl Iterator<Item = &'a Ipv4Addr>) {
        let mut pool = self.ip_pool.lock().unwrap();
        for addr in assigned {
            pool.mark(*addr);
        }
    }

    pub fn tap_name_for(&self, slug: &str) -> String {
        tap_name_for(slug)
    }

    /// Idempotent: creates the TAP in tap mode, brings it up, and attaches it
    /// to the bridge if the kernel doesn't already have it.
    pub async fn ensure_tap(&self, tap_name: &str) -> Result<()> {
        if self.tap_exists(tap_name).await? {
            debug!("tap {tap_name} already present, skipping creation");
        } else {
            run_ip(&["tuntap", "add", "dev", tap_name, "mode", "tap"]).await?;
            run_ip(&["link", "set", tap_name, "up"]).await?;
            info!("created tap device {tap_name}");
        }

        match run_ip(&["link", "set", tap_name, "master", &self.network.bridge_name]).await {
            Ok(()) => Ok(()),
            Err(Error::NetworkSetup(msg)) if already_exists(&msg) => {
                debug!("tap {tap_name} already attached to bridge {}", self.network.bridge_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotent: removes the TAP from the bridge then deletes it. Never
    /// fails the caller.
    pub async fn delete_tap(&self, tap_name: &str) {
        if let Err(e) = run_ip(&["link", "set", tap_name, "nomaster"]).await {
            debug!("detaching tap {tap_name} from bridge (non-fatal): {e}");
        }
        if let Err(e) = run_ip(&["link", "delete", tap_name]).await {
            warn!("deleting tap {tap_name} failed (ignored): {e}");
        }
    }

    /// Idempotent: creates the bridge, assigns the gateway address, brings
    /// it up.
    pub async fn ensure_bridge(&self) -> Result<()> {
        match run_ip(&["link", "add", "name", &self.network.bridge_name, "type", "bridge"]).await {
            Ok(()) => {}
            Err(Error::NetworkSetup(msg)) if already_exists(&msg) => {
                debug!("bridge {} already exists", self.network.bridge_name);
            }
            Err(e) => return Err(e),
        }

        let cidr = format!("{}/{}", self.network.gateway, self.network.prefix_len);
        match run_ip(&["addr", "add", &cidr, "dev", &self.network.bridge_name]).await {
            Ok(()) => {}
            Err(Error::NetworkSetup(msg)) if already_exists(&msg) => {}
            Err(e) => return Err(e),
        }

        run_ip(&["link", "set", &self.network.bridge_name, "up"]).await
    }

    /// Enumerate host TAPs with our prefix and delete any not in `keep`.
    pub async fn orphan_sweep(&self, keep: &HashSet<String>) -> Result<()> {
        for tap in self.list_host_taps().await? {
            if !keep.contains(&tap) {
                info!("sweeping orphaned tap {tap}");
                self.delete_tap(&tap).await;
            }
        }
        Ok(())
    }

    async fn tap_exists(&self, tap_name: &str) -> Result<bool> {
        Ok(self.list_host_taps().await?.contains(&tap_name.to_string()))
    }

    async fn list_host_taps(&self) -> Result<Vec<String>> {
        let output = Command::new("ip")
            .args(["-o", "link", "show"])
            .output()
            .await
            .map_err(|e| Error::NetworkSetup(format!("listing host interfaces: {e}")))?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| line.split(':').nth(1))
            .map(|s| s.trim().split('@').next().unwrap_or("").to_string())
            .filter(|name| name.starts_with(TAP_PREFIX))
            .collect())
    }
}

fn already_exists(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("exists") || lower.contains("file exists")
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::NetworkSetup(format!("spawning ip {args:?}: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(Error::NetworkSetup(format!("ip {args:?} failed: {stderr}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_deterministic_and_bounded() {
        let a = tap_name_for("hello");
        let b = tap_name_for("hello");
        assert_eq!(a, b);
        assert!(a.len() <= 15);
        assert!(a.starts_with("tap-"));
    }

    #[test]
    fn test_tap_name_differs_per_slug() {
        assert_ne!(tap_name_for("hello"), tap_name_for("world"));
    }

    #[test]
    fn test_ip_allocation_skips_gateway_and_network() {
        let mut pool = IpPoolInner::new("192.168.127.1".parse().unwrap());
        let first = pool.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(192, 168, 127, 2));
    }

    #[test]
    fn test_ip_allocation_wraps_and_skips_marked() {
        let mut pool = IpPoolInner::new("192.168.127.1".parse().unwrap());
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.deallocate(a);
        let c = pool.allocate().unwrap();
        // `a`'s slot is free again and should eventually be reused once the
        // cursor wraps back around.
        assert!(c == a || c != b);
    }

    #[test]
    fn test_ip_pool_exhaustion() {
        let mut pool = IpPoolInner::new("192.168.127.1".parse().unwrap());
        for _ in 0..253 {
            pool.allocate().unwrap();
        }
        assert!(matches!(pool.allocate(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn test_deallocate_unknown_address_is_noop() {
        let mut pool = IpPoolInner::new("192.168.127.1".parse().unwrap());
        pool.deallocate(Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_load_persisted_assignments_marks_addresses() {
        let allocator = Allocator::new(NetworkConfig::default()).unwrap();
        let persisted = vec![Ipv4Addr::new(192, 168, 127, 2)];
        allocator.load_persisted_assignments(persisted.iter());

        let next = allocator.allocate_ip().unwrap();
        assert_ne!(next, Ipv4Addr::new(192, 168, 127, 2));
    }
}
