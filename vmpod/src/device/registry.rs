//! Per-sandbox device registry.
//!
//! The registry owns every device a sandbox carries, assigns stable
//! identifiers, reference-counts shared attachments and drives the
//! hypervisor for the actual plug/unplug work.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::config::{BlockDeviceDriver, DeviceInfo, MachineType};
use crate::device::{
    is_skipped_block_major, kind_from_info, virt_drive_name, BlockIndexAllocator, Device,
    DeviceId, DeviceKind,
};
use crate::hypervisor::HypervisorDriver;
use crate::layout::guest_paths;

/// Typed catalog of a sandbox's devices.
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
    allocator: BlockIndexAllocator,
    block_driver: BlockDeviceDriver,
}

impl DeviceRegistry {
    pub fn new(block_driver: BlockDeviceDriver) -> Self {
        Self {
            devices: HashMap::new(),
            allocator: BlockIndexAllocator::new(),
            block_driver,
        }
    }

    /// Validate a caller-requested device and catalog it.
    ///
    /// The same host path always resolves to the same identifier, so
    /// multiple containers binding one device share the entry.
    pub fn new_device(&mut self, info: &DeviceInfo) -> VmpodResult<DeviceId> {
        let kind = kind_from_info(info)?;

        if let Some(existing) = self.find_by_host_path(&info.host_path) {
            return Ok(existing);
        }

        let device = Device::new(kind);
        let id = device.id.clone();
        tracing::debug!(device_id = %id, path = %info.host_path.display(), "cataloged device");
        self.devices.insert(id.clone(), device);
        Ok(id)
    }

    /// Catalog an internally constructed device (rootfs block, virtio-fs).
    pub fn register(&mut self, kind: DeviceKind) -> DeviceId {
        let device = Device::new(kind);
        let id = device.id.clone();
        self.devices.insert(id.clone(), device);
        id
    }

    fn find_by_host_path(&self, path: &Path) -> Option<DeviceId> {
        self.devices
            .values()
            .find(|d| match &d.kind {
                DeviceKind::Block { path: p, .. } => p == path,
                DeviceKind::Generic { path: p, .. } => p == path,
                DeviceKind::VhostUserBlock { socket } => socket == path,
                _ => false,
            })
            .map(|d| d.id.clone())
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id)
    }

    /// Identifiers of all currently attached devices.
    pub fn attached_ids(&self) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.attached)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Number of indices the block allocator currently holds.
    pub fn block_indices_in_use(&self) -> u32 {
        self.allocator.in_use()
    }

    /// Attach a device, plugging it into the VM on first use.
    ///
    /// Idempotent: attaching an attached device only bumps its reference
    /// count. Block devices receive the lowest free block index and a
    /// transport chosen from the hypervisor configuration.
    pub async fn attach(
        &mut self,
        id: &DeviceId,
        driver: &mut dyn HypervisorDriver,
    ) -> VmpodResult<()> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| VmpodError::DeviceNotExist(id.to_string()))?;

        if device.attached {
            let device = self.devices.get_mut(id).expect("checked above");
            device.ref_count += 1;
            tracing::debug!(device_id = %id, ref_count = device.ref_count, "device already attached");
            return Ok(());
        }

        if !device.kind.needs_vm_attach() {
            let device = self.devices.get_mut(id).expect("checked above");
            device.attached = true;
            device.ref_count = 1;
            return Ok(());
        }

        if let DeviceKind::Block { major, .. } = &device.kind {
            if is_skipped_block_major(*major) {
                return Err(VmpodError::DeviceInvalid(format!(
                    "refusing to attach removable-media device (major {})",
                    major
                )));
            }
        }

        // Block devices get an index before the VMM sees them so the
        // expected guest name is known even on transports without
        // address feedback.
        let block_index = match &device.kind {
            DeviceKind::Block { .. } => Some(self.allocator.allocate()),
            _ => None,
        };

        let mut staged = device.clone();
        staged.block_index = block_index;

        let plugged = driver.hotplug_add(&staged).await;

        let guest = match plugged {
            Ok(address) => address,
            Err(e) => {
                if let Some(index) = block_index {
                    self.allocator.release(index);
                }
                return Err(match e {
                    VmpodError::NotSupported(m) => VmpodError::NotSupported(m),
                    other => VmpodError::DeviceAttachFailed(other.to_string()),
                });
            }
        };

        let device = self.devices.get_mut(id).expect("checked above");
        device.block_index = block_index;
        device.guest = Some(guest);
        device.attached = true;
        device.ref_count = 1;
        tracing::info!(device_id = %id, guest = ?device.guest, "attached device");
        Ok(())
    }

    /// Detach a device, unplugging it when the last reference drops.
    ///
    /// Idempotent: detaching a detached device is a no-op. The block index
    /// is released only after the VMM acknowledges removal.
    pub async fn detach(
        &mut self,
        id: &DeviceId,
        driver: &mut dyn HypervisorDriver,
    ) -> VmpodResult<()> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| VmpodError::DeviceNotExist(id.to_string()))?;

        if !device.attached {
            return Ok(());
        }
        if device.ref_count > 1 {
            let device = self.devices.get_mut(id).expect("checked above");
            device.ref_count -= 1;
            tracing::debug!(device_id = %id, ref_count = device.ref_count, "device still referenced");
            return Ok(());
        }

        if device.kind.needs_vm_attach() {
            let staged = device.clone();
            driver.hotplug_remove(&staged).await?;
        }

        let device = self.devices.get_mut(id).expect("checked above");
        if let Some(index) = device.block_index.take() {
            self.allocator.release(index);
        }
        device.guest = None;
        device.attached = false;
        device.ref_count = 0;
        tracing::info!(device_id = %id, "detached device");
        Ok(())
    }

    /// Expected guest device node for a block device, from its index and
    /// the configured transport.
    pub fn expected_virt_path(&self, id: &DeviceId) -> Option<String> {
        let device = self.devices.get(id)?;
        let index = device.block_index?;
        match self.block_driver {
            BlockDeviceDriver::VirtioBlk
            | BlockDeviceDriver::VirtioMmio
            | BlockDeviceDriver::Nvdimm => Some(format!("/dev/{}", virt_drive_name(index))),
            BlockDeviceDriver::VirtioScsi => {
                Some(format!("/dev/sd{}", &virt_drive_name(index)[2..]))
            }
            BlockDeviceDriver::VirtioBlkCcw => Some(format!("/dev/{}", virt_drive_name(index))),
        }
    }

    /// Guest path where all containers mount a shared block source; the
    /// encoding makes distinct sources collide-free while containers that
    /// share a source converge on one path.
    pub fn guest_mount_path(guest_source: &str) -> String {
        let encoded = URL_SAFE_NO_PAD.encode(guest_source.as_bytes());
        format!("{}/{}", guest_paths::STORAGE_DIR, encoded)
    }

    /// Partition device ids into (immediate, delayed) attach lists.
    ///
    /// Large-BAR VFIO devices on Q35-like machines are delayed: they must
    /// attach after the initial container creation call.
    pub fn split_delayed(
        &self,
        ids: &[DeviceId],
        machine: MachineType,
    ) -> (Vec<DeviceId>, Vec<DeviceId>) {
        let mut immediate = Vec::new();
        let mut delayed = Vec::new();
        for id in ids {
            let is_delayed = matches!(
                self.devices.get(id).map(|d| &d.kind),
                Some(DeviceKind::VfioPci { large_bar: true, .. })
            ) && machine == MachineType::Q35;
            if is_delayed {
                delayed.push(id.clone());
            } else {
                immediate.push(id.clone());
            }
        }
        (immediate, delayed)
    }

    /// Order a VFIO list for cold plug: control nodes first.
    pub fn order_vfio_cold_plug(&self, ids: &mut Vec<DeviceId>) {
        ids.sort_by_key(|id| {
            let is_control = matches!(
                self.devices.get(id).map(|d| &d.kind),
                Some(DeviceKind::Generic { path, .. })
                    if path.as_path() == Path::new("/dev/vfio/vfio")
            );
            !is_control
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GuestAddress;
    use crate::hypervisor::MockHypervisor;
    use std::path::PathBuf;

    fn block_info(path: &str, major: i64) -> DeviceInfo {
        DeviceInfo {
            host_path: PathBuf::from(path),
            container_path: PathBuf::from("/data"),
            dev_type: "b".into(),
            major,
            minor: 0,
        }
    }

    #[tokio::test]
    async fn attach_allocates_index_and_stores_guest_address() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        let id = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();

        reg.attach(&id, &mut driver).await.unwrap();

        let dev = reg.get(&id).unwrap();
        assert!(dev.attached);
        assert_eq!(dev.block_index, Some(0));
        assert_eq!(dev.guest, Some(GuestAddress::VirtPath("/dev/vda".into())));
        assert_eq!(reg.block_indices_in_use(), 1);
    }

    #[tokio::test]
    async fn same_host_path_shares_one_entry() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let id1 = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();
        let id2 = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn refcounted_attach_detach() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        let id = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();

        reg.attach(&id, &mut driver).await.unwrap();
        reg.attach(&id, &mut driver).await.unwrap();
        assert_eq!(reg.get(&id).unwrap().ref_count, 2);

        reg.detach(&id, &mut driver).await.unwrap();
        assert!(reg.get(&id).unwrap().attached);

        reg.detach(&id, &mut driver).await.unwrap();
        assert!(!reg.get(&id).unwrap().attached);
        assert_eq!(reg.block_indices_in_use(), 0);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        let id = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();

        reg.attach(&id, &mut driver).await.unwrap();
        reg.detach(&id, &mut driver).await.unwrap();
        reg.detach(&id, &mut driver).await.unwrap();
    }

    #[tokio::test]
    async fn attach_failure_releases_index() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        driver.fail_next_hotplug("bus full");
        let id = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();

        let err = reg.attach(&id, &mut driver).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceAttachFailed");
        assert_eq!(reg.block_indices_in_use(), 0);
        assert!(!reg.get(&id).unwrap().attached);
    }

    #[tokio::test]
    async fn cdrom_majors_refuse_to_attach() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        let id = reg.new_device(&block_info("/dev/sr0", 11)).unwrap();
        let err = reg.attach(&id, &mut driver).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceInvalid");
    }

    #[tokio::test]
    async fn released_index_is_reused_by_next_attach() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let mut driver = MockHypervisor::new();
        let a = reg.new_device(&block_info("/dev/loop0", 7)).unwrap();
        let b = reg.new_device(&block_info("/dev/loop1", 7)).unwrap();

        reg.attach(&a, &mut driver).await.unwrap();
        reg.attach(&b, &mut driver).await.unwrap();
        reg.detach(&a, &mut driver).await.unwrap();

        let c = reg.new_device(&block_info("/dev/loop2", 7)).unwrap();
        reg.attach(&c, &mut driver).await.unwrap();
        assert_eq!(reg.get(&c).unwrap().block_index, Some(0));
    }

    #[test]
    fn guest_mount_path_is_stable_per_source() {
        let p1 = DeviceRegistry::guest_mount_path("/dev/vda");
        let p2 = DeviceRegistry::guest_mount_path("/dev/vda");
        let p3 = DeviceRegistry::guest_mount_path("/dev/vdb");
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
        assert!(p1.starts_with(guest_paths::STORAGE_DIR));
    }

    #[test]
    fn large_bar_vfio_is_delayed_on_q35_only() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let normal = reg.register(DeviceKind::VfioPci {
            bdf: "0000:65:00.0".into(),
            sysfs_path: PathBuf::from("/sys/bus/pci/devices/0000:65:00.0"),
            large_bar: false,
        });
        let large = reg.register(DeviceKind::VfioPci {
            bdf: "0000:66:00.0".into(),
            sysfs_path: PathBuf::from("/sys/bus/pci/devices/0000:66:00.0"),
            large_bar: true,
        });

        let ids = vec![normal.clone(), large.clone()];
        let (immediate, delayed) = reg.split_delayed(&ids, MachineType::Q35);
        assert_eq!(immediate, vec![normal.clone()]);
        assert_eq!(delayed, vec![large.clone()]);

        let (immediate, delayed) = reg.split_delayed(&ids, MachineType::MicroVm);
        assert_eq!(immediate.len(), 2);
        assert!(delayed.is_empty());
    }

    #[test]
    fn vfio_control_node_sorts_first_for_cold_plug() {
        let mut reg = DeviceRegistry::new(BlockDeviceDriver::VirtioBlk);
        let group = reg.new_device(&DeviceInfo {
            host_path: PathBuf::from("/dev/vfio/12"),
            container_path: PathBuf::from("/dev/vfio/12"),
            dev_type: "c".into(),
            major: 10,
            minor: 196,
        })
        .unwrap();
        let control = reg.new_device(&DeviceInfo {
            host_path: PathBuf::from("/dev/vfio/vfio"),
            container_path: PathBuf::from("/dev/vfio/vfio"),
            dev_type: "c".into(),
            major: 10,
            minor: 196,
        })
        .unwrap();

        let mut ids = vec![group.clone(), control.clone()];
        reg.order_vfio_cold_plug(&mut ids);
        assert_eq!(ids, vec![control, group]);
    }
}
