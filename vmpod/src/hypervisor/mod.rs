//! Hypervisor driver abstraction.
//!
//! One driver per supported VMM, all speaking the same operation set over
//! whatever control channel the VMM exposes. A driver owns its control
//! socket exclusively; its lifetime bounds the socket's.

pub mod micro;
pub mod mock;
pub mod pci;
pub mod process;
pub mod qmp;
pub mod rest;

pub use micro::FirecrackerDriver;
pub use mock::MockHypervisor;
pub use qmp::QemuDriver;
pub use rest::CloudHypervisorDriver;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vmpod_shared::{Transport, VmpodResult};

use crate::config::{BlockDeviceDriver, HypervisorConfig, HypervisorKind, MachineType};
use crate::device::{Device, GuestAddress};
use crate::layout::SandboxLayout;

/// Capability bits a driver reports truthfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub fs_sharing: bool,
    pub block_hotplug: bool,
    pub memory_probe: bool,
    pub hybrid_vsock: bool,
    /// Hard ceiling on hotpluggable vCPUs, 0 = no driver limit.
    pub max_vcpus: u32,
}

/// Driver-observed VMM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmmState {
    NotReady,
    Created,
    Running,
    Paused,
    Stopped,
}

/// Everything a driver needs to configure one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub sandbox_id: String,
    pub vcpus: u32,
    pub max_vcpus: u32,
    pub memory_mib: u32,
    pub memory_slots: u32,
    pub machine_type: MachineType,
    pub block_device_driver: BlockDeviceDriver,

    pub hypervisor_bin: PathBuf,
    pub jailer_bin: Option<PathBuf>,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub firmware: Option<PathBuf>,
    pub cmdline: String,

    pub api_socket: PathBuf,
    pub vsock: Transport,
    pub console_log: PathBuf,
    pub sandbox_dir: PathBuf,

    pub hugepages: bool,
    pub iommu: bool,
}

impl VmConfig {
    /// Assemble the driver-neutral parts from a sandbox's configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn from_sandbox(
        sandbox_id: &str,
        hv: &HypervisorConfig,
        layout: &SandboxLayout,
        hypervisor_bin: PathBuf,
        jailer_bin: Option<PathBuf>,
        kernel: PathBuf,
        initrd: Option<PathBuf>,
        image: Option<PathBuf>,
        firmware: Option<PathBuf>,
        cmdline: String,
        vsock: Transport,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            vcpus: hv.default_vcpus,
            max_vcpus: hv.effective_maxvcpus(),
            memory_mib: hv.default_memory_mib,
            memory_slots: hv.memory_slots,
            machine_type: hv.machine_type,
            block_device_driver: hv.block_device_driver,
            hypervisor_bin,
            jailer_bin,
            kernel,
            initrd,
            image,
            firmware,
            cmdline,
            api_socket: layout.api_socket(),
            vsock,
            console_log: layout.console_log(),
            sandbox_dir: layout.root().to_path_buf(),
            hugepages: hv.enable_hugepages,
            iommu: hv.iommu,
        }
    }
}

/// Serializable driver state for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorState {
    pub kind: HypervisorKind,
    pub sandbox_id: String,
    pub pid: Option<u32>,
    pub api_socket: PathBuf,
    pub state: VmmState,
}

/// Uniform operation set over concrete VMMs.
#[async_trait]
pub trait HypervisorDriver: Send {
    /// Prepare configuration only. MUST NOT spawn the VMM process; it may
    /// create sockets and directories.
    async fn create_vm(&mut self, config: VmConfig) -> VmpodResult<()>;

    /// Launch the VMM, wait for the control channel, submit the VM
    /// configuration and boot. `timeout` bounds the liveness probing.
    async fn start_vm(&mut self, timeout: Duration) -> VmpodResult<()>;

    /// Stop the VMM. `wait_only` skips the graceful control-channel
    /// shutdown and only waits for process exit.
    async fn stop_vm(&mut self, wait_only: bool) -> VmpodResult<()>;

    async fn pause_vm(&mut self) -> VmpodResult<()>;
    async fn resume_vm(&mut self) -> VmpodResult<()>;

    /// Cold-plug a device before boot.
    async fn add_device(&mut self, device: &Device) -> VmpodResult<()>;

    /// Hotplug a device into the running VM, returning its guest address.
    async fn hotplug_add(&mut self, device: &Device) -> VmpodResult<GuestAddress>;

    /// Remove a previously hotplugged device.
    async fn hotplug_remove(&mut self, device: &Device) -> VmpodResult<()>;

    /// Grow guest memory to `target_mib`, aligning the hotplugged amount
    /// up to `block_mib`. Returns the resulting size. Shrinking is a no-op.
    async fn resize_memory(
        &mut self,
        target_mib: u32,
        block_mib: u32,
        probe: bool,
    ) -> VmpodResult<u32>;

    /// Resize the online vCPU count. Returns the resulting count.
    async fn resize_vcpus(&mut self, count: u32) -> VmpodResult<u32>;

    async fn get_vm_console(&self) -> VmpodResult<PathBuf>;
    async fn get_thread_ids(&self) -> VmpodResult<Vec<u32>>;

    fn capabilities(&self) -> Capabilities;

    /// Liveness probe of the control channel.
    async fn check(&self) -> VmpodResult<()>;

    /// Snapshot for persistence.
    fn save_state(&self) -> VmpodResult<HypervisorState>;

    /// Adopt a persisted snapshot (reconnecting supervisor). The VM
    /// configuration itself is re-supplied through `create_vm`; this only
    /// restores the driver's observation of the VMM.
    fn load_state(&mut self, state: HypervisorState) -> VmpodResult<()>;

    /// Remove sockets and the sandbox directory contents this driver owns.
    async fn cleanup(&mut self) -> VmpodResult<()>;

    /// Drop the control channel without stopping the VM.
    async fn disconnect(&mut self);

    fn pid(&self) -> Option<u32>;
    fn vmm_state(&self) -> VmmState;
}

/// Construct the driver for a configured hypervisor kind.
pub fn new_driver(kind: HypervisorKind, hv: &HypervisorConfig) -> Box<dyn HypervisorDriver> {
    match kind {
        HypervisorKind::CloudHypervisor => Box::new(CloudHypervisorDriver::new(hv.clone())),
        HypervisorKind::Qemu => Box::new(QemuDriver::new(hv.clone())),
        HypervisorKind::Firecracker => Box::new(FirecrackerDriver::new(hv.clone())),
    }
}
