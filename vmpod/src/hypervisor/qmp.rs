//! QMP-over-unix-socket VMM driver (q35 and micro-VM machine flavors).
//!
//! The control channel is QMP: newline-delimited JSON with a capability
//! handshake. The connection persists for the life of the driver; events
//! arriving between command responses are logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};

use vmpod_shared::{Transport, VmpodError, VmpodResult};

use crate::config::{HypervisorConfig, MachineType};
use crate::device::{Device, DeviceKind, GuestAddress};
use crate::hypervisor::process::VmmProcess;
use crate::hypervisor::{Capabilities, HypervisorDriver, HypervisorState, VmConfig, VmmState};
use crate::layout::remove_socket;

const PROBE_STEP: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// First hotpluggable PCI slot on the q35 root bus; lower slots are taken
/// by the boot-time devices the driver itself configures.
const FIRST_HOTPLUG_SLOT: u8 = 0x05;

/// Persistent QMP connection.
struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect, consume the greeting and negotiate capabilities.
    async fn connect(socket: &Path) -> VmpodResult<Self> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            VmpodError::Internal(format!("QMP socket {} unreachable: {}", socket.display(), e))
        })?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(VmpodError::Internal(format!(
                "unexpected QMP greeting: {}",
                greeting
            )));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> VmpodResult<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(VmpodError::Internal("QMP connection closed".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }

    /// Execute a command and return its `return` payload.
    async fn execute(&mut self, command: &str, arguments: Option<Value>) -> VmpodResult<Value> {
        let mut msg = json!({ "execute": command });
        if let Some(args) = arguments {
            msg["arguments"] = args;
        }
        let mut wire = msg.to_string();
        wire.push('\n');
        self.writer.write_all(wire.as_bytes()).await?;

        loop {
            let reply = self.read_message().await?;
            if let Some(event) = reply.get("event") {
                tracing::debug!(%event, "QMP event");
                continue;
            }
            if let Some(err) = reply.get("error") {
                return Err(VmpodError::Internal(format!(
                    "QMP {} failed: {}",
                    command, err
                )));
            }
            if let Some(ret) = reply.get("return") {
                return Ok(ret.clone());
            }
            tracing::debug!(%reply, "unexpected QMP message skipped");
        }
    }
}

/// Driver for a QMP-controlled VMM.
pub struct QemuDriver {
    config: HypervisorConfig,
    vm: Option<VmConfig>,
    process: Option<VmmProcess>,
    client: Option<QmpClient>,
    state: VmmState,
    pending: Vec<Device>,
    /// Attached hotplug devices and the guest slot each occupies.
    attached: HashMap<String, u8>,
    next_slot: u8,
    next_mmio_slot: u32,
    next_dimm: u32,
    cur_memory_mib: u32,
    cur_vcpus: u32,
}

impl QemuDriver {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            config,
            vm: None,
            process: None,
            client: None,
            state: VmmState::NotReady,
            pending: Vec::new(),
            attached: HashMap::new(),
            next_slot: FIRST_HOTPLUG_SLOT,
            next_mmio_slot: 0,
            next_dimm: 0,
            cur_memory_mib: 0,
            cur_vcpus: 0,
        }
    }

    fn vm_ref(&self) -> VmpodResult<&VmConfig> {
        self.vm
            .as_ref()
            .ok_or_else(|| VmpodError::ConfigInvalid("create_vm was not called".into()))
    }

    fn is_microvm(&self) -> bool {
        self.vm
            .as_ref()
            .map(|vm| vm.machine_type == MachineType::MicroVm)
            .unwrap_or(false)
    }

    fn client_mut(&mut self) -> VmpodResult<&mut QmpClient> {
        self.client
            .as_mut()
            .ok_or_else(|| VmpodError::Internal("QMP channel not connected".into()))
    }

    /// Command-line for the VMM process; the VM is fully described up
    /// front and started paused, so boot is a `cont` away.
    fn build_args(&self) -> VmpodResult<Vec<String>> {
        let vm = self.vm_ref()?;
        let machine = match vm.machine_type {
            MachineType::Q35 => "q35,accel=kvm".to_string(),
            MachineType::MicroVm => "microvm,accel=kvm".to_string(),
        };

        let mut args: Vec<String> = vec![
            "-name".into(),
            format!("sandbox-{}", vm.sandbox_id),
            "-machine".into(),
            machine,
            "-qmp".into(),
            format!("unix:{},server=on,wait=off", vm.api_socket.display()),
            "-m".into(),
            format!(
                "{}M,slots={},maxmem={}M",
                vm.memory_mib,
                vm.memory_slots,
                vm.memory_mib as u64 + 16 * 1024
            ),
            "-smp".into(),
            format!("{},maxcpus={}", vm.vcpus, vm.max_vcpus.max(vm.vcpus)),
            "-kernel".into(),
            vm.kernel.display().to_string(),
            "-append".into(),
            vm.cmdline.clone(),
            "-serial".into(),
            format!("file:{}", vm.console_log.display()),
            "-display".into(),
            "none".into(),
            "-S".into(),
        ];

        if let Some(initrd) = &vm.initrd {
            args.push("-initrd".into());
            args.push(initrd.display().to_string());
        }
        if let Transport::VSock { cid, .. } = &vm.vsock {
            args.push("-device".into());
            args.push(format!("vhost-vsock-pci,guest-cid={}", cid));
        }
        if vm.hugepages {
            args.push("-mem-prealloc".into());
        }

        for dev in &self.pending {
            match &dev.kind {
                DeviceKind::Block {
                    path, read_only, ..
                } => {
                    args.push("-drive".into());
                    args.push(format!(
                        "file={},if=virtio,format=raw,readonly={}",
                        path.display(),
                        if *read_only { "on" } else { "off" }
                    ));
                }
                DeviceKind::VirtioFs { tag, socket } => {
                    args.push("-chardev".into());
                    args.push(format!(
                        "socket,id=char-{},path={}",
                        tag,
                        socket.display()
                    ));
                    args.push("-device".into());
                    args.push(format!(
                        "vhost-user-fs-pci,chardev=char-{},tag={}",
                        tag, tag
                    ));
                }
                other => {
                    tracing::warn!(kind = ?other, "unsupported cold-plug device ignored");
                }
            }
        }

        Ok(args)
    }

    async fn query_status(&mut self) -> VmpodResult<String> {
        let ret = self.client_mut()?.execute("query-status", None).await?;
        Ok(ret
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    async fn create_vm(&mut self, config: VmConfig) -> VmpodResult<()> {
        std::fs::create_dir_all(&config.sandbox_dir).map_err(|e| {
            VmpodError::ConfigInvalid(format!(
                "cannot create sandbox dir {}: {}",
                config.sandbox_dir.display(),
                e
            ))
        })?;
        remove_socket(&config.api_socket);

        self.cur_memory_mib = config.memory_mib;
        self.cur_vcpus = config.vcpus;
        self.vm = Some(config);
        self.state = VmmState::NotReady;
        Ok(())
    }

    async fn start_vm(&mut self, timeout: Duration) -> VmpodResult<()> {
        let args = self.build_args()?;
        let vm = self.vm_ref()?.clone();

        let process = VmmProcess::spawn("qemu", &vm.hypervisor_bin, &args)?;
        self.process = Some(process);

        let deadline = tokio::time::Instant::now() + timeout;
        let client = loop {
            match QmpClient::connect(&vm.api_socket).await {
                Ok(client) => break client,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        if let Some(p) = self.process.as_mut() {
                            let _ = p.kill().await;
                        }
                        return Err(VmpodError::VmStartFailed(format!(
                            "QMP socket never became live: {}",
                            e
                        )));
                    }
                    tracing::debug!(error = %e, "QMP probe failed, retrying");
                    tokio::time::sleep(PROBE_STEP).await;
                }
            }
        };
        self.client = Some(client);

        // Launched with -S: the machine is configured but held before boot.
        let status = self.query_status().await?;
        if status != "prelaunch" {
            return Err(VmpodError::VmStartInconsistent(format!(
                "expected prelaunch after config submission, observed {}",
                status
            )));
        }
        self.state = VmmState::Created;

        self.client_mut()?.execute("cont", None).await?;

        let status = self.query_status().await?;
        if status != "running" {
            return Err(VmpodError::VmStartInconsistent(format!(
                "expected running after boot, observed {}",
                status
            )));
        }
        self.state = VmmState::Running;
        Ok(())
    }

    async fn stop_vm(&mut self, wait_only: bool) -> VmpodResult<()> {
        if self.state == VmmState::Stopped && self.process.is_none() {
            return Ok(());
        }

        if !wait_only {
            if let Ok(client) = self.client_mut() {
                let _ = client.execute("system_powerdown", None).await;
                let _ = client.execute("quit", None).await;
            }
        }

        if let Some(process) = self.process.as_mut() {
            if process.wait_exited(STOP_TIMEOUT).await.is_err() {
                tracing::warn!(pid = process.pid(), "VMM did not exit in time, killing");
                process.kill().await?;
            }
        }
        self.process = None;
        self.client = None;
        self.state = VmmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&mut self) -> VmpodResult<()> {
        self.client_mut()?.execute("stop", None).await?;
        self.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&mut self) -> VmpodResult<()> {
        self.client_mut()?.execute("cont", None).await?;
        self.state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&mut self, device: &Device) -> VmpodResult<()> {
        if self.state == VmmState::Running {
            return Err(VmpodError::DeviceAttachFailed(
                "cold-plug requested on a running VM".into(),
            ));
        }
        self.pending.push(device.clone());
        Ok(())
    }

    async fn hotplug_add(&mut self, device: &Device) -> VmpodResult<GuestAddress> {
        let microvm = self.is_microvm();
        let dev_id = device.id.as_str().to_string();

        match &device.kind {
            DeviceKind::Block {
                path, read_only, ..
            } => {
                let node = format!("blk-{}", dev_id);
                let blockdev = json!({
                    "driver": "raw",
                    "node-name": node,
                    "read-only": read_only,
                    "file": { "driver": "host_device", "filename": path },
                });
                self.client_mut()?
                    .execute("blockdev-add", Some(blockdev))
                    .await?;

                if microvm {
                    let slot = self.next_mmio_slot;
                    let args = json!({
                        "driver": "virtio-blk-device",
                        "drive": node,
                        "id": dev_id,
                    });
                    self.client_mut()?.execute("device_add", Some(args)).await?;
                    self.next_mmio_slot += 1;
                    self.attached.insert(dev_id, slot as u8);
                    Ok(GuestAddress::MmioSlot(slot))
                } else {
                    let slot = self.next_slot;
                    let args = json!({
                        "driver": "virtio-blk-pci",
                        "drive": node,
                        "id": dev_id,
                        "bus": "pcie.0",
                        "addr": format!("{:#04x}", slot),
                    });
                    self.client_mut()?.execute("device_add", Some(args)).await?;
                    self.next_slot += 1;
                    self.attached.insert(dev_id, slot);
                    Ok(GuestAddress::PciPath(format!("{:02x}", slot)))
                }
            }
            DeviceKind::VfioPci { sysfs_path, .. } => {
                if microvm {
                    return Err(VmpodError::DeviceAttachFailed(
                        "VFIO passthrough needs a PCI machine type".into(),
                    ));
                }
                let slot = self.next_slot;
                let args = json!({
                    "driver": "vfio-pci",
                    "sysfsdev": sysfs_path,
                    "id": dev_id,
                    "bus": "pcie.0",
                    "addr": format!("{:#04x}", slot),
                });
                self.client_mut()?.execute("device_add", Some(args)).await?;
                self.next_slot += 1;
                self.attached.insert(dev_id, slot);
                Ok(GuestAddress::PciPath(format!("{:02x}", slot)))
            }
            other => Err(VmpodError::DeviceAttachFailed(format!(
                "device kind {:?} is not hotpluggable on this VMM",
                other.id_prefix()
            ))),
        }
    }

    async fn hotplug_remove(&mut self, device: &Device) -> VmpodResult<()> {
        if !self.attached.contains_key(device.id.as_str()) {
            return Err(VmpodError::DeviceNotAttached(device.id.to_string()));
        }
        let args = json!({ "id": device.id.as_str() });
        self.client_mut()?.execute("device_del", Some(args)).await?;
        self.attached.remove(device.id.as_str());
        Ok(())
    }

    async fn resize_memory(
        &mut self,
        target_mib: u32,
        block_mib: u32,
        probe: bool,
    ) -> VmpodResult<u32> {
        if probe {
            return Err(VmpodError::NotSupported(
                "memory probe is not supported by this VMM".into(),
            ));
        }
        if target_mib <= self.cur_memory_mib {
            tracing::info!(
                current_mib = self.cur_memory_mib,
                target_mib,
                "memory resize target not above current size, skipping"
            );
            return Ok(self.cur_memory_mib);
        }

        let hotplug = (target_mib - self.cur_memory_mib).div_ceil(block_mib) * block_mib;
        let dimm = self.next_dimm;

        let backend = json!({
            "qom-type": "memory-backend-ram",
            "id": format!("mem{}", dimm),
            "size": (hotplug as u64) * 1024 * 1024,
        });
        self.client_mut()?.execute("object-add", Some(backend)).await?;

        let dimm_args = json!({
            "driver": "pc-dimm",
            "id": format!("dimm{}", dimm),
            "memdev": format!("mem{}", dimm),
        });
        self.client_mut()?.execute("device_add", Some(dimm_args)).await?;

        self.next_dimm += 1;
        self.cur_memory_mib += hotplug;
        Ok(self.cur_memory_mib)
    }

    async fn resize_vcpus(&mut self, count: u32) -> VmpodResult<u32> {
        if count == 0 {
            return Err(VmpodError::ConfigInvalid("cannot resize to 0 vcpus".into()));
        }
        if count <= self.cur_vcpus {
            tracing::info!(
                current = self.cur_vcpus,
                requested = count,
                "vcpu shrink requested, keeping current count"
            );
            return Ok(self.cur_vcpus);
        }

        let max = self.vm_ref()?.max_vcpus.max(self.vm_ref()?.vcpus);
        let capped = count.min(max);

        // Plug unfilled sockets reported by the VMM until the target count.
        let hotpluggable = self
            .client_mut()?
            .execute("query-hotpluggable-cpus", None)
            .await?;
        let Some(entries) = hotpluggable.as_array() else {
            return Err(VmpodError::Internal(
                "malformed query-hotpluggable-cpus reply".into(),
            ));
        };

        let mut online = self.cur_vcpus;
        for entry in entries {
            if online >= capped {
                break;
            }
            if entry.get("qom-path").is_some() {
                continue; // already plugged
            }
            let driver = entry.get("type").and_then(Value::as_str).unwrap_or_default();
            let mut args = json!({
                "driver": driver,
                "id": format!("cpu-{}", online),
            });
            if let Some(props) = entry.get("props") {
                if let Some(map) = props.as_object() {
                    for (k, v) in map {
                        args[k.as_str()] = v.clone();
                    }
                }
            }
            self.client_mut()?.execute("device_add", Some(args)).await?;
            online += 1;
        }

        self.cur_vcpus = online;
        Ok(online)
    }

    async fn get_vm_console(&self) -> VmpodResult<PathBuf> {
        Ok(self.vm_ref()?.console_log.clone())
    }

    async fn get_thread_ids(&self) -> VmpodResult<Vec<u32>> {
        let Some(pid) = self.pid() else {
            return Ok(Vec::new());
        };
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
            if let Ok(tid) = entry?.file_name().to_string_lossy().parse() {
                tids.push(tid);
            }
        }
        Ok(tids)
    }

    fn capabilities(&self) -> Capabilities {
        let microvm = self.is_microvm()
            || self.vm.is_none() && self.config.machine_type == MachineType::MicroVm;
        Capabilities {
            fs_sharing: true,
            block_hotplug: true,
            memory_probe: false,
            hybrid_vsock: false,
            max_vcpus: self.config.effective_maxvcpus(),
        }
        .with_mmio(microvm)
    }

    async fn check(&self) -> VmpodResult<()> {
        // The QMP channel is request/response on &mut; liveness here is the
        // child process still answering signal 0.
        match self.process.as_ref() {
            Some(p) if p.is_alive() => Ok(()),
            _ => Err(VmpodError::Internal("VMM process is not alive".into())),
        }
    }

    fn save_state(&self) -> VmpodResult<HypervisorState> {
        let vm = self.vm_ref()?;
        Ok(HypervisorState {
            kind: crate::config::HypervisorKind::Qemu,
            sandbox_id: vm.sandbox_id.clone(),
            pid: self.pid(),
            api_socket: vm.api_socket.clone(),
            state: self.state,
        })
    }

    fn load_state(&mut self, state: HypervisorState) -> VmpodResult<()> {
        if state.kind != crate::config::HypervisorKind::Qemu {
            return Err(VmpodError::ConfigInvalid(format!(
                "state saved by {:?} driver",
                state.kind
            )));
        }
        self.state = state.state;
        Ok(())
    }

    async fn cleanup(&mut self) -> VmpodResult<()> {
        if let Some(vm) = self.vm.as_ref() {
            remove_socket(&vm.api_socket);
            if let Transport::HybridVSock { uds, .. } = &vm.vsock {
                remove_socket(uds);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    fn vmm_state(&self) -> VmmState {
        self.state
    }
}

impl Capabilities {
    /// MMIO machines keep block hotplug but lose PCI-dependent features.
    fn with_mmio(mut self, mmio: bool) -> Self {
        if mmio {
            self.fs_sharing = false;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockDeviceDriver;

    fn test_vm_config(dir: &Path, machine: MachineType) -> VmConfig {
        VmConfig {
            sandbox_id: "s1".into(),
            vcpus: 2,
            max_vcpus: 8,
            memory_mib: 512,
            memory_slots: 10,
            machine_type: machine,
            block_device_driver: BlockDeviceDriver::VirtioBlk,
            hypervisor_bin: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            jailer_bin: None,
            kernel: PathBuf::from("/opt/vmpod/vmlinux"),
            initrd: None,
            image: None,
            firmware: None,
            cmdline: "console=ttyS0".into(),
            api_socket: dir.join("qmp.sock"),
            vsock: Transport::vsock(3, 1024),
            console_log: dir.join("console.log"),
            sandbox_dir: dir.to_path_buf(),
            hugepages: false,
            iommu: false,
        }
    }

    #[tokio::test]
    async fn q35_args_carry_machine_and_qmp_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new(HypervisorConfig::default());
        driver
            .create_vm(test_vm_config(dir.path(), MachineType::Q35))
            .await
            .unwrap();

        let args = driver.build_args().unwrap();
        let machine_idx = args.iter().position(|a| a == "-machine").unwrap();
        assert!(args[machine_idx + 1].starts_with("q35"));
        assert!(args.iter().any(|a| a.contains("qmp.sock")));
        assert!(args.contains(&"-S".to_string()));
    }

    #[tokio::test]
    async fn microvm_args_use_microvm_machine() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new(HypervisorConfig::default());
        driver
            .create_vm(test_vm_config(dir.path(), MachineType::MicroVm))
            .await
            .unwrap();

        let args = driver.build_args().unwrap();
        let machine_idx = args.iter().position(|a| a == "-machine").unwrap();
        assert!(args[machine_idx + 1].starts_with("microvm"));
    }

    #[tokio::test]
    async fn create_vm_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new(HypervisorConfig::default());
        driver
            .create_vm(test_vm_config(dir.path(), MachineType::Q35))
            .await
            .unwrap();
        assert!(driver.pid().is_none());
        assert_eq!(driver.vmm_state(), VmmState::NotReady);
    }

    #[tokio::test]
    async fn hotplug_remove_unknown_device_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = QemuDriver::new(HypervisorConfig::default());
        driver
            .create_vm(test_vm_config(dir.path(), MachineType::Q35))
            .await
            .unwrap();

        let dev = Device::new(DeviceKind::Block {
            path: PathBuf::from("/dev/loop3"),
            major: 7,
            minor: 3,
            read_only: false,
            fs_type: None,
        });
        let err = driver.hotplug_remove(&dev).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceNotAttached");
    }

    #[test]
    fn drive_names_match_block_indices() {
        assert_eq!(crate::device::virt_drive_name(0), "vda");
    }
}
