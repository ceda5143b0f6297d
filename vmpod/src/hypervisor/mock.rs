//! Recording mock hypervisor for tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::config::HypervisorKind;
use crate::device::{virt_drive_name, Device, DeviceKind, GuestAddress};
use crate::hypervisor::{Capabilities, HypervisorDriver, HypervisorState, VmConfig, VmmState};

/// Shared journal of driver calls, cloneable before the driver is boxed.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// In-memory hypervisor that records every operation.
pub struct MockHypervisor {
    calls: CallLog,
    capabilities: Capabilities,
    vm: Option<VmConfig>,
    state: VmmState,
    attached: Vec<String>,
    cur_memory_mib: u32,
    cur_vcpus: u32,
    next_block: u32,
    /// When set, the next `hotplug_add` fails with this message.
    fail_next_hotplug: Option<String>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            capabilities: Capabilities {
                fs_sharing: true,
                block_hotplug: true,
                memory_probe: false,
                hybrid_vsock: true,
                max_vcpus: 32,
            },
            vm: None,
            state: VmmState::NotReady,
            attached: Vec::new(),
            cur_memory_mib: 0,
            cur_vcpus: 0,
            next_block: 0,
            fail_next_hotplug: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Handle onto the call journal; survives boxing the driver.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn fail_next_hotplug(&mut self, message: impl Into<String>) {
        self.fail_next_hotplug = Some(message.into());
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl HypervisorDriver for MockHypervisor {
    async fn create_vm(&mut self, config: VmConfig) -> VmpodResult<()> {
        self.record(format!("create_vm:{}", config.sandbox_id));
        self.cur_memory_mib = config.memory_mib;
        self.cur_vcpus = config.vcpus;
        self.vm = Some(config);
        self.state = VmmState::NotReady;
        Ok(())
    }

    async fn start_vm(&mut self, _timeout: Duration) -> VmpodResult<()> {
        if self.vm.is_none() {
            return Err(VmpodError::VmStartFailed("create_vm was not called".into()));
        }
        self.record("start_vm");
        self.state = VmmState::Created;
        self.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&mut self, wait_only: bool) -> VmpodResult<()> {
        self.record(format!("stop_vm:wait_only={}", wait_only));
        self.state = VmmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&mut self) -> VmpodResult<()> {
        self.record("pause_vm");
        self.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&mut self) -> VmpodResult<()> {
        self.record("resume_vm");
        self.state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&mut self, device: &Device) -> VmpodResult<()> {
        self.record(format!("add_device:{}", device.id));
        Ok(())
    }

    async fn hotplug_add(&mut self, device: &Device) -> VmpodResult<GuestAddress> {
        if let Some(message) = self.fail_next_hotplug.take() {
            return Err(VmpodError::DeviceAttachFailed(message));
        }
        self.record(format!("hotplug_add:{}", device.id));
        self.attached.push(device.id.as_str().to_string());

        match &device.kind {
            DeviceKind::Block { .. } => {
                let index = device.block_index.unwrap_or_else(|| {
                    let i = self.next_block;
                    self.next_block += 1;
                    i
                });
                Ok(GuestAddress::VirtPath(format!(
                    "/dev/{}",
                    virt_drive_name(index)
                )))
            }
            _ => Ok(GuestAddress::PciPath(format!(
                "{:02x}",
                5 + self.attached.len()
            ))),
        }
    }

    async fn hotplug_remove(&mut self, device: &Device) -> VmpodResult<()> {
        let id = device.id.as_str();
        let Some(pos) = self.attached.iter().position(|d| d == id) else {
            return Err(VmpodError::DeviceNotAttached(id.to_string()));
        };
        self.record(format!("hotplug_remove:{}", device.id));
        self.attached.remove(pos);
        Ok(())
    }

    async fn resize_memory(
        &mut self,
        target_mib: u32,
        block_mib: u32,
        probe: bool,
    ) -> VmpodResult<u32> {
        if probe && !self.capabilities.memory_probe {
            return Err(VmpodError::NotSupported("memory probe".into()));
        }
        if target_mib <= self.cur_memory_mib {
            self.record(format!("resize_memory:noop:{}", target_mib));
            return Ok(self.cur_memory_mib);
        }
        let hotplug = (target_mib - self.cur_memory_mib).div_ceil(block_mib) * block_mib;
        self.cur_memory_mib += hotplug;
        self.record(format!("resize_memory:{}", self.cur_memory_mib));
        Ok(self.cur_memory_mib)
    }

    async fn resize_vcpus(&mut self, count: u32) -> VmpodResult<u32> {
        if count == 0 {
            return Err(VmpodError::ConfigInvalid("cannot resize to 0 vcpus".into()));
        }
        if count <= self.cur_vcpus {
            self.record(format!("resize_vcpus:noop:{}", count));
            return Ok(self.cur_vcpus);
        }
        self.cur_vcpus = count.min(self.capabilities.max_vcpus);
        self.record(format!("resize_vcpus:{}", self.cur_vcpus));
        Ok(self.cur_vcpus)
    }

    async fn get_vm_console(&self) -> VmpodResult<PathBuf> {
        Ok(self
            .vm
            .as_ref()
            .map(|vm| vm.console_log.clone())
            .unwrap_or_default())
    }

    async fn get_thread_ids(&self) -> VmpodResult<Vec<u32>> {
        Ok(vec![1000])
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn check(&self) -> VmpodResult<()> {
        if self.state == VmmState::Running {
            Ok(())
        } else {
            Err(VmpodError::Internal("vm is not running".into()))
        }
    }

    fn save_state(&self) -> VmpodResult<HypervisorState> {
        Ok(HypervisorState {
            kind: HypervisorKind::CloudHypervisor,
            sandbox_id: self
                .vm
                .as_ref()
                .map(|vm| vm.sandbox_id.clone())
                .unwrap_or_default(),
            pid: self.pid(),
            api_socket: self
                .vm
                .as_ref()
                .map(|vm| vm.api_socket.clone())
                .unwrap_or_default(),
            state: self.state,
        })
    }

    fn load_state(&mut self, state: HypervisorState) -> VmpodResult<()> {
        self.record("load_state");
        self.state = state.state;
        Ok(())
    }

    async fn cleanup(&mut self) -> VmpodResult<()> {
        self.record("cleanup");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.record("disconnect");
    }

    fn pid(&self) -> Option<u32> {
        match self.state {
            VmmState::Running | VmmState::Paused | VmmState::Created => Some(4242),
            _ => None,
        }
    }

    fn vmm_state(&self) -> VmmState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_lifecycle_calls() {
        let mut mock = MockHypervisor::new();
        let log = mock.call_log();

        let config = VmConfig {
            sandbox_id: "s1".into(),
            vcpus: 1,
            max_vcpus: 4,
            memory_mib: 256,
            memory_slots: 4,
            machine_type: crate::config::MachineType::MicroVm,
            block_device_driver: crate::config::BlockDeviceDriver::VirtioBlk,
            hypervisor_bin: PathBuf::from("/bin/true"),
            jailer_bin: None,
            kernel: PathBuf::from("/vmlinux"),
            initrd: None,
            image: None,
            firmware: None,
            cmdline: String::new(),
            api_socket: PathBuf::from("/tmp/api.sock"),
            vsock: vmpod_shared::Transport::Mock,
            console_log: PathBuf::from("/tmp/console.log"),
            sandbox_dir: PathBuf::from("/tmp"),
            hugepages: false,
            iommu: false,
        };
        mock.create_vm(config).await.unwrap();
        mock.start_vm(Duration::from_secs(1)).await.unwrap();
        mock.stop_vm(false).await.unwrap();

        let calls = log.lock().clone();
        assert_eq!(
            calls,
            vec!["create_vm:s1", "start_vm", "stop_vm:wait_only=false"]
        );
    }

    #[tokio::test]
    async fn double_detach_is_not_attached() {
        let mut mock = MockHypervisor::new();
        let dev = Device::new(DeviceKind::VirtioRng);
        mock.hotplug_add(&dev).await.unwrap();
        mock.hotplug_remove(&dev).await.unwrap();
        let err = mock.hotplug_remove(&dev).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceNotAttached");
    }

    #[tokio::test]
    async fn memory_resize_aligns_to_block() {
        let mut mock = MockHypervisor::new();
        mock.cur_memory_mib = 1024;
        // 1024 -> 2100 with 128 MiB blocks: hotplug 1152, final 2176.
        assert_eq!(mock.resize_memory(2100, 128, false).await.unwrap(), 2176);
    }
}
