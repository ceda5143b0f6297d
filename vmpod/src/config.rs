//! Runtime, sandbox and container configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vmpod_shared::{VmpodError, VmpodResult};

use crate::assets::{AssetEntry, AssetKind, DigestAlgorithm};
use crate::mount::{Mount, RootFs};

/// Minimum memory any hypervisor configuration may request, in MiB.
pub const MIN_HYPERVISOR_MEMORY_MIB: u32 = 64;

/// Default memory hotplug block size, in MiB.
pub const DEFAULT_MEMORY_BLOCK_MIB: u32 = 128;

/// Options for the runtime as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Root of the on-disk state: per-sandbox directories live underneath.
    pub store_dir: PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let store_dir = std::env::var_os("VMPOD_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".vmpod")))
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmpod"));
        Self { store_dir }
    }
}

/// Supported hypervisor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorKind {
    /// REST control API over a unix socket (cloud-hypervisor style).
    CloudHypervisor,
    /// QMP control channel over a unix socket (q35 or microvm machine).
    Qemu,
    /// Minimal micro-VM with MMIO-only transports (firecracker style).
    Firecracker,
}

impl FromStr for HypervisorKind {
    type Err = VmpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cloud-hypervisor" | "clh" => Ok(HypervisorKind::CloudHypervisor),
            "qemu" => Ok(HypervisorKind::Qemu),
            "firecracker" | "fc" | "micro-vm" => Ok(HypervisorKind::Firecracker),
            _ => Err(VmpodError::ConfigInvalid(format!(
                "unknown hypervisor kind '{}'; supported: cloud-hypervisor, qemu, firecracker",
                s
            ))),
        }
    }
}

/// Guest hardware layout family exposed by the VMM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineType {
    #[default]
    Q35,
    MicroVm,
}

/// Transport used for block devices handed to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockDeviceDriver {
    #[default]
    VirtioBlk,
    VirtioScsi,
    VirtioMmio,
    Nvdimm,
    VirtioBlkCcw,
}

impl FromStr for BlockDeviceDriver {
    type Err = VmpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virtio-blk" => Ok(BlockDeviceDriver::VirtioBlk),
            "virtio-scsi" => Ok(BlockDeviceDriver::VirtioScsi),
            "virtio-mmio" => Ok(BlockDeviceDriver::VirtioMmio),
            "nvdimm" => Ok(BlockDeviceDriver::Nvdimm),
            "virtio-blk-ccw" => Ok(BlockDeviceDriver::VirtioBlkCcw),
            _ => Err(VmpodError::AnnotationInvalid(format!(
                "unknown block device driver '{}'",
                s
            ))),
        }
    }
}

impl BlockDeviceDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockDeviceDriver::VirtioBlk => "virtio-blk",
            BlockDeviceDriver::VirtioScsi => "virtio-scsi",
            BlockDeviceDriver::VirtioMmio => "virtio-mmio",
            BlockDeviceDriver::Nvdimm => "nvdimm",
            BlockDeviceDriver::VirtioBlkCcw => "virtio-blk-ccw",
        }
    }
}

/// Shared filesystem flavor between host and guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SharedFsKind {
    Virtio9p,
    #[default]
    VirtioFs,
    VirtioFsNydus,
    None,
}

impl FromStr for SharedFsKind {
    type Err = VmpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virtio-9p" => Ok(SharedFsKind::Virtio9p),
            "virtio-fs" => Ok(SharedFsKind::VirtioFs),
            "virtio-fs-nydus" => Ok(SharedFsKind::VirtioFsNydus),
            "none" => Ok(SharedFsKind::None),
            _ => Err(VmpodError::AnnotationInvalid(format!(
                "unknown shared_fs '{}'",
                s
            ))),
        }
    }
}

/// How VFIO devices are surfaced to the workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VfioMode {
    /// The guest kernel claims the device; `/dev/vfio/*` nodes are pruned
    /// from the container spec.
    #[default]
    GuestKernel,
    /// The container gets the VFIO char devices directly.
    Vfio,
}

/// Hypervisor configuration for one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    pub kind: HypervisorKind,
    pub machine_type: MachineType,

    /// Boot assets: override path and/or expected digest per kind.
    pub assets: HashMap<AssetKind, AssetEntry>,
    pub digest_algorithm: DigestAlgorithm,

    pub default_vcpus: u32,
    pub default_maxvcpus: u32,
    pub default_memory_mib: u32,
    pub memory_slots: u32,
    pub memory_offset_mib: u32,
    pub memory_block_mib: u32,
    pub enable_virtio_mem: bool,
    pub enable_mem_prealloc: bool,
    pub enable_swap: bool,
    pub enable_hugepages: bool,
    pub iommu: bool,
    pub enable_iommu_platform: bool,

    pub block_device_driver: BlockDeviceDriver,
    pub shared_fs: SharedFsKind,
    pub virtio_fs_daemon: PathBuf,
    pub virtio_fs_cache: String,
    pub virtio_fs_cache_size_mib: u32,
    pub virtio_fs_extra_args: Vec<String>,

    /// Extra kernel parameters appended after driver defaults.
    pub kernel_params: String,

    pub disable_image_nvdimm: bool,
    pub hotplug_vfio_on_root_bus: bool,
    pub pcie_root_port: u32,
    pub sgx_epc_bytes: u64,

    pub guest_selinux_label: Option<String>,
    pub debug: bool,

    /// Seconds to wait for the control socket after launching the VMM.
    pub boot_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            kind: HypervisorKind::CloudHypervisor,
            machine_type: MachineType::default(),
            assets: HashMap::new(),
            digest_algorithm: DigestAlgorithm::default(),
            default_vcpus: 1,
            default_maxvcpus: 0,
            default_memory_mib: 2048,
            memory_slots: 10,
            memory_offset_mib: 0,
            memory_block_mib: DEFAULT_MEMORY_BLOCK_MIB,
            enable_virtio_mem: false,
            enable_mem_prealloc: false,
            enable_swap: false,
            enable_hugepages: false,
            iommu: false,
            enable_iommu_platform: false,
            block_device_driver: BlockDeviceDriver::default(),
            shared_fs: SharedFsKind::default(),
            virtio_fs_daemon: PathBuf::from("/usr/libexec/virtiofsd"),
            virtio_fs_cache: "auto".to_string(),
            virtio_fs_cache_size_mib: 0,
            virtio_fs_extra_args: Vec::new(),
            kernel_params: String::new(),
            disable_image_nvdimm: false,
            hotplug_vfio_on_root_bus: false,
            pcie_root_port: 0,
            sgx_epc_bytes: 0,
            guest_selinux_label: None,
            debug: false,
            boot_timeout_secs: 10,
        }
    }
}

impl HypervisorConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Ceiling for hotpluggable vCPUs; 0 means "same as default_vcpus".
    pub fn effective_maxvcpus(&self) -> u32 {
        if self.default_maxvcpus == 0 {
            self.default_vcpus
        } else {
            self.default_maxvcpus
        }
    }

    pub fn validate(&self) -> VmpodResult<()> {
        if self.default_vcpus == 0 {
            return Err(VmpodError::ConfigInvalid(
                "default_vcpus must be at least 1".into(),
            ));
        }
        if self.default_memory_mib < MIN_HYPERVISOR_MEMORY_MIB {
            return Err(VmpodError::ConfigInvalid(format!(
                "default_memory {} MiB below hypervisor minimum {} MiB",
                self.default_memory_mib, MIN_HYPERVISOR_MEMORY_MIB
            )));
        }
        if self.memory_block_mib == 0 {
            return Err(VmpodError::ConfigInvalid(
                "memory_block_mib must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Guest agent dialing and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub dial_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub check_timeout_secs: u64,
    pub create_container_timeout_secs: u64,
    pub kernel_modules: Vec<String>,
    pub trace: bool,
    pub container_pipe_size: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            request_timeout_secs: 60,
            check_timeout_secs: 30,
            create_container_timeout_secs: 60,
            kernel_modules: Vec::new(),
            trace: false,
            container_pipe_size: 0,
        }
    }
}

/// Runtime-level policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub disable_guest_seccomp: bool,
    pub sandbox_cgroup_only: bool,
    pub disable_new_netns: bool,
    pub inter_network_model: String,
    pub vfio_mode: VfioMode,
}

/// Whether a workload is the pod sandbox itself or a container joining it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerType {
    #[default]
    PodSandbox,
    PodContainer,
}

/// CPU and memory demand carried by one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub memory_limit_bytes: Option<i64>,
}

impl ContainerResources {
    /// Whole vCPUs this container demands: quota/period rounded up.
    pub fn vcpus(&self) -> u32 {
        match (self.cpu_quota, self.cpu_period) {
            (Some(quota), Some(period)) if quota > 0 && period > 0 => {
                ((quota as u64 + period - 1) / period) as u32
            }
            _ => 0,
        }
    }

    /// Number of CPUs named by the cpuset expression (`0-2,7` -> 4).
    pub fn cpuset_count(&self) -> u32 {
        let Some(set) = self.cpuset_cpus.as_deref() else {
            return 0;
        };
        let mut count = 0u32;
        for part in set.split(',').filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                        if hi >= lo {
                            count += hi - lo + 1;
                        }
                    }
                }
                None => {
                    if part.trim().parse::<u32>().is_ok() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Memory contribution in MiB; containers without a limit contribute 0.
    pub fn memory_mib(&self) -> u32 {
        match self.memory_limit_bytes {
            Some(bytes) if bytes > 0 => (bytes as u64 / (1024 * 1024)) as u32,
            _ => 0,
        }
    }

    /// Extract the subset of an OCI spec this runtime sizes VMs from.
    pub fn from_spec(spec: &oci_spec::runtime::Spec) -> Self {
        let mut out = Self::default();
        if let Some(linux) = spec.linux() {
            if let Some(resources) = linux.resources() {
                if let Some(cpu) = resources.cpu() {
                    out.cpu_quota = cpu.quota().as_ref().copied();
                    out.cpu_period = cpu.period().as_ref().copied();
                    out.cpuset_cpus = cpu.cpus().clone();
                }
                if let Some(memory) = resources.memory() {
                    out.memory_limit_bytes = memory.limit().as_ref().copied();
                }
            }
        }
        out
    }
}

/// Host-side description of a device requested by a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Host path of the device node or resource.
    pub host_path: PathBuf,
    /// Path the container expects the device at.
    pub container_path: PathBuf,
    /// One of `c`, `b`, `u`, `p`.
    pub dev_type: String,
    pub major: i64,
    pub minor: i64,
}

/// Configuration of a single container inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub container_id: String,
    pub container_type: ContainerType,
    pub rootfs: RootFs,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceInfo>,
    pub resources: ContainerResources,
    /// Guest-bound copy of the OCI spec; pruned before dispatch.
    pub spec: oci_spec::runtime::Spec,
    pub annotations: HashMap<String, String>,
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub sandbox_id: String,
    pub bundle_path: PathBuf,
    pub hypervisor: HypervisorConfig,
    pub agent: AgentConfig,
    pub policy: RuntimePolicy,
    pub annotations: HashMap<String, String>,
    /// Globs that annotation-supplied paths must match.
    pub path_allowlist: Vec<String>,
    pub containers: Vec<ContainerConfig>,
    /// Size of the sandbox /dev/shm tmpfs, bytes; 0 disables it.
    pub shm_size: u64,
}

impl SandboxConfig {
    pub fn validate(&self) -> VmpodResult<()> {
        if self.sandbox_id.is_empty() {
            return Err(VmpodError::ConfigInvalid("empty sandbox id".into()));
        }
        self.hypervisor.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypervisor_kind_parses_aliases() {
        assert_eq!(
            "micro-vm".parse::<HypervisorKind>().unwrap(),
            HypervisorKind::Firecracker
        );
        assert_eq!(
            "cloud-hypervisor".parse::<HypervisorKind>().unwrap(),
            HypervisorKind::CloudHypervisor
        );
        assert!("xen".parse::<HypervisorKind>().is_err());
    }

    #[test]
    fn vcpu_demand_rounds_up() {
        let r = ContainerResources {
            cpu_quota: Some(150_000),
            cpu_period: Some(100_000),
            ..Default::default()
        };
        assert_eq!(r.vcpus(), 2);

        let none = ContainerResources::default();
        assert_eq!(none.vcpus(), 0);
    }

    #[test]
    fn cpuset_count_handles_ranges() {
        let r = ContainerResources {
            cpuset_cpus: Some("0-2,7".into()),
            ..Default::default()
        };
        assert_eq!(r.cpuset_count(), 4);
    }

    #[test]
    fn memory_contribution_without_limit_is_zero() {
        assert_eq!(ContainerResources::default().memory_mib(), 0);
        let r = ContainerResources {
            memory_limit_bytes: Some(512 * 1024 * 1024),
            ..Default::default()
        };
        assert_eq!(r.memory_mib(), 512);
    }

    #[test]
    fn config_validation_rejects_zero_vcpus() {
        let mut hv = HypervisorConfig::default();
        hv.default_vcpus = 0;
        assert_eq!(hv.validate().unwrap_err().kind(), "ConfigInvalid");
    }

    #[test]
    fn sandbox_validation_rejects_empty_id() {
        let cfg = SandboxConfig {
            sandbox_id: String::new(),
            bundle_path: PathBuf::from("/tmp/bundle"),
            hypervisor: HypervisorConfig::default(),
            agent: AgentConfig::default(),
            policy: RuntimePolicy::default(),
            annotations: HashMap::new(),
            path_allowlist: Vec::new(),
            containers: Vec::new(),
            shm_size: 0,
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), "ConfigInvalid");
    }
}
