use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Instance configuration contract (design §4.2): 1 vCPU, 512 MiB, dirty-page
/// tracking always on (a configuration invariant required for differential
/// snapshots, not an optional toggle), one writable root block device, one
/// NIC bound to an allocator-supplied TAP, and a static-IP kernel cmdline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub track_dirty_pages: bool,
    pub rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    pub tap_device: String,
    pub guest_mac: String,
    pub ip_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl VmConfig {
    pub fn new(
        rootfs_path: PathBuf,
        kernel_path: PathBuf,
        tap_device: String,
        ip_address: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Self {
        Self {
            vcpu_count: 1,
            mem_size_mib: 512,
            track_dirty_pages: true,
            rootfs_path,
            kernel_path,
            tap_device,
            guest_mac: mac_for(&ip_address),
            ip_address,
            gateway,
        }
    }

    /// `ip=<VM-IP>::<gateway>:255.255.255.0::eth0:off` plus serial console
    /// and panic-on-error flags, per design §4.2.
    pub fn kernel_boot_args(&self) -> String {
        format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.255.0::eth0:off",
            self.ip_address, self.gateway
        )
    }
}

/// Fixed vendor-local MAC, derived from the guest's IP so it stays stable
/// across restarts of the same plugin without a separate allocation table.
fn mac_for(ip: &Ipv4Addr) -> String {
    let o = ip.octets();
    format!("AA:FC:00:{:02X}:{:02X}:{:02X}", o[1], o[2], o[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_boot_args_format() {
        let config = VmConfig::new(
            PathBuf::from("/tmp/rootfs.ext4"),
            PathBuf::from("/tmp/vmlinux"),
            "tap-abc12345".to_string(),
            "192.168.127.2".parse().unwrap(),
            "192.168.127.1".parse().unwrap(),
        );
        let args = config.kernel_boot_args();
        assert!(args.contains("ip=192.168.127.2::192.168.127.1:255.255.255.0::eth0:off"));
    }

    #[test]
    fn test_mac_is_stable_for_same_ip() {
        let ip: Ipv4Addr = "192.168.127.10".parse().unwrap();
        assert_eq!(mac_for(&ip), mac_for(&ip));
    }

    #[test]
    fn test_dirty_page_tracking_always_on() {
        let config = VmConfig::new(
            PathBuf::from("/tmp/rootfs.ext4"),
            PathBuf::from("/tmp/vmlinux"),
            "tap-abc12345".to_string(),
            "192.168.127.2".parse().unwrap(),
            "192.168.127.1".parse().unwrap(),
        );
        assert!(config.track_dirty_pages);
    }
}
