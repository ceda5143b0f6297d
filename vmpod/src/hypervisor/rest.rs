//! REST-over-unix-socket VMM driver (cloud-hypervisor style).
//!
//! The VMM exposes a small HTTP/1.1 API on a unix socket. One request per
//! connection keeps the client trivial; the VMM side tolerates that.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use vmpod_shared::{Transport, VmpodError, VmpodResult};

use crate::config::HypervisorConfig;
use crate::device::{Device, DeviceKind, GuestAddress};
use crate::hypervisor::process::VmmProcess;
use crate::hypervisor::{
    pci, Capabilities, HypervisorDriver, HypervisorState, VmConfig, VmmState,
};
use crate::layout::remove_socket;

const API_BASE: &str = "/api/v1";
const PROBE_STEP: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Issue one HTTP request over the control socket and return the body.
async fn api_request(
    socket: &Path,
    method: &str,
    endpoint: &str,
    body: Option<String>,
) -> VmpodResult<Option<String>> {
    let mut stream = UnixStream::connect(socket).await.map_err(|e| {
        VmpodError::Internal(format!(
            "control socket {} unreachable: {}",
            socket.display(),
            e
        ))
    })?;

    let body = body.unwrap_or_default();
    let request = format!(
        "{} {}{} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        API_BASE,
        endpoint,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let response = String::from_utf8_lossy(&raw);

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VmpodError::Internal(format!("malformed API response: {}", response)))?;

    let payload = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.trim().to_string())
        .filter(|b| !b.is_empty());

    if (200..300).contains(&status) {
        Ok(payload)
    } else {
        Err(VmpodError::Internal(format!(
            "API {} {} returned {}: {}",
            method,
            endpoint,
            status,
            payload.unwrap_or_default()
        )))
    }
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct PciDeviceInfo {
    #[allow(dead_code)]
    id: String,
    bdf: String,
}

/// Driver for a REST-controlled VMM.
pub struct CloudHypervisorDriver {
    config: HypervisorConfig,
    vm: Option<VmConfig>,
    process: Option<VmmProcess>,
    state: VmmState,
    /// Devices cold-plugged before boot, folded into the create payload.
    pending: Vec<Device>,
    attached: HashSet<String>,
    cur_memory_mib: u32,
    cur_vcpus: u32,
}

impl CloudHypervisorDriver {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            config,
            vm: None,
            process: None,
            state: VmmState::NotReady,
            pending: Vec::new(),
            attached: HashSet::new(),
            cur_memory_mib: 0,
            cur_vcpus: 0,
        }
    }

    fn vm_ref(&self) -> VmpodResult<&VmConfig> {
        self.vm
            .as_ref()
            .ok_or_else(|| VmpodError::ConfigInvalid("create_vm was not called".into()))
    }

    async fn query_state(&self) -> VmpodResult<String> {
        let vm = self.vm_ref()?;
        let body = api_request(&vm.api_socket, "GET", "/vm.info", None)
            .await?
            .ok_or_else(|| VmpodError::Internal("empty vm.info response".into()))?;
        let info: VmInfo = serde_json::from_str(&body)?;
        Ok(info.state)
    }

    /// Build the `vm.create` payload from the stored configuration.
    fn create_payload(&self) -> VmpodResult<String> {
        let vm = self.vm_ref()?;

        let mut payload = json!({
            "cpus": {
                "boot_vcpus": vm.vcpus,
                "max_vcpus": vm.max_vcpus.max(vm.vcpus),
            },
            "memory": {
                "size": (vm.memory_mib as u64) * 1024 * 1024,
                "hotplug_size": (vm.memory_mib as u64 + 16 * 1024) * 1024 * 1024,
                "shared": true,
                "hugepages": vm.hugepages,
            },
            "payload": {
                "kernel": vm.kernel,
                "cmdline": vm.cmdline,
            },
            "console": { "mode": "File", "file": vm.console_log },
            "serial": { "mode": "Off" },
        });

        if let Some(initrd) = &vm.initrd {
            payload["payload"]["initramfs"] = json!(initrd);
        }
        if let Some(firmware) = &vm.firmware {
            payload["payload"]["firmware"] = json!(firmware);
        }
        if let Transport::HybridVSock { uds, port: _ } = &vm.vsock {
            payload["vsock"] = json!({ "cid": 3, "socket": uds });
        }

        let mut disks = Vec::new();
        let mut fses = Vec::new();
        for dev in &self.pending {
            match &dev.kind {
                DeviceKind::Block {
                    path, read_only, ..
                } => disks.push(json!({
                    "path": path,
                    "readonly": read_only,
                    "id": dev.id.as_str(),
                })),
                DeviceKind::VirtioFs { tag, socket } => fses.push(json!({
                    "tag": tag,
                    "socket": socket,
                    "num_queues": 1,
                    "queue_size": 1024,
                })),
                other => {
                    tracing::warn!(kind = ?other, "unsupported cold-plug device ignored");
                }
            }
        }
        if !disks.is_empty() {
            payload["disks"] = json!(disks);
        }
        if !fses.is_empty() {
            payload["fs"] = json!(fses);
        }

        Ok(payload.to_string())
    }
}

#[async_trait]
impl HypervisorDriver for CloudHypervisorDriver {
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
        let vm = self.vm_ref()?.clone();

        let args = vec![
            "--api-socket".to_string(),
            vm.api_socket.display().to_string(),
        ];
        let process = VmmProcess::spawn("cloud-hypervisor", &vm.hypervisor_bin, &args)?;
        self.process = Some(process);

        // Probe the control channel until it answers or the timeout runs out.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match api_request(&vm.api_socket, "GET", "/vmm.ping", None).await {
                Ok(_) => break,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        if let Some(p) = self.process.as_mut() {
                            let _ = p.kill().await;
                        }
                        return Err(VmpodError::VmStartFailed(format!(
                            "control socket never became live: {}",
                            e
                        )));
                    }
                    tracing::debug!(error = %e, "VMM liveness probe failed, retrying");
                    tokio::time::sleep(PROBE_STEP).await;
                }
            }
        }

        let payload = self.create_payload()?;
        api_request(&vm.api_socket, "PUT", "/vm.create", Some(payload)).await?;

        let observed = self.query_state().await?;
        if observed != "Created" {
            return Err(VmpodError::VmStartInconsistent(format!(
                "expected Created after config submission, observed {}",
                observed
            )));
        }
        self.state = VmmState::Created;

        api_request(&vm.api_socket, "PUT", "/vm.boot", None).await?;

        let observed = self.query_state().await?;
        if observed != "Running" {
            return Err(VmpodError::VmStartInconsistent(format!(
                "expected Running after boot, observed {}",
                observed
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
            if let Ok(vm) = self.vm_ref() {
                let _ = api_request(&vm.api_socket, "PUT", "/vm.shutdown", None).await;
                let _ = api_request(&vm.api_socket, "PUT", "/vmm.shutdown", None).await;
            }
        }

        if let Some(process) = self.process.as_mut() {
            if process.wait_exited(STOP_TIMEOUT).await.is_err() {
                tracing::warn!(pid = process.pid(), "VMM did not exit in time, killing");
                process.kill().await?;
            }
        }
        self.process = None;
        self.state = VmmState::Stopped;
        Ok(())
    }

    async fn pause_vm(&mut self) -> VmpodResult<()> {
        let vm = self.vm_ref()?;
        api_request(&vm.api_socket, "PUT", "/vm.pause", None).await?;
        self.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&mut self) -> VmpodResult<()> {
        let vm = self.vm_ref()?;
        api_request(&vm.api_socket, "PUT", "/vm.resume", None).await?;
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
        let vm = self.vm_ref()?;

        let (endpoint, body) = match &device.kind {
            DeviceKind::Block {
                path, read_only, ..
            } => (
                "/vm.add-disk",
                json!({
                    "path": path,
                    "readonly": read_only,
                    "id": device.id.as_str(),
                }),
            ),
            DeviceKind::VhostUserBlock { socket } => (
                "/vm.add-disk",
                json!({
                    "vhost_user": true,
                    "vhost_socket": socket,
                    "id": device.id.as_str(),
                }),
            ),
            DeviceKind::VfioPci { sysfs_path, .. } => (
                "/vm.add-device",
                json!({
                    "path": sysfs_path,
                    "id": device.id.as_str(),
                }),
            ),
            DeviceKind::VirtioFs { tag, socket } => (
                "/vm.add-fs",
                json!({
                    "tag": tag,
                    "socket": socket,
                    "id": device.id.as_str(),
                }),
            ),
            other => {
                return Err(VmpodError::DeviceAttachFailed(format!(
                    "device kind {:?} is not hotpluggable on this VMM",
                    other.id_prefix()
                )))
            }
        };

        let response = api_request(&vm.api_socket, "PUT", endpoint, Some(body.to_string()))
            .await
            .map_err(|e| VmpodError::DeviceAttachFailed(e.to_string()))?;

        let address = match response {
            Some(body) => {
                let info: PciDeviceInfo = serde_json::from_str(&body)?;
                GuestAddress::PciPath(pci::slot_from_bdf(&info.bdf)?)
            }
            None => {
                return Err(VmpodError::DeviceAttachFailed(
                    "VMM returned no device info".into(),
                ))
            }
        };

        self.attached.insert(device.id.as_str().to_string());
        Ok(address)
    }

    async fn hotplug_remove(&mut self, device: &Device) -> VmpodResult<()> {
        if !self.attached.contains(device.id.as_str()) {
            return Err(VmpodError::DeviceNotAttached(device.id.to_string()));
        }
        let vm = self.vm_ref()?;
        let body = json!({ "id": device.id.as_str() }).to_string();
        api_request(&vm.api_socket, "PUT", "/vm.remove-device", Some(body)).await?;
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
        let new_mib = self.cur_memory_mib + hotplug;

        let vm = self.vm_ref()?;
        let body = json!({ "desired_ram": (new_mib as u64) * 1024 * 1024 }).to_string();
        api_request(&vm.api_socket, "PUT", "/vm.resize", Some(body)).await?;

        self.cur_memory_mib = new_mib;
        Ok(new_mib)
    }

    async fn resize_vcpus(&mut self, count: u32) -> VmpodResult<u32> {
        if count == 0 {
            return Err(VmpodError::ConfigInvalid("cannot resize to 0 vcpus".into()));
        }
        if count <= self.cur_vcpus {
            // vCPU removal is not required; leave the current count online.
            tracing::info!(
                current = self.cur_vcpus,
                requested = count,
                "vcpu shrink requested, keeping current count"
            );
            return Ok(self.cur_vcpus);
        }

        let vm = self.vm_ref()?;
        let capped = count.min(vm.max_vcpus.max(vm.vcpus));
        let body = json!({ "desired_vcpus": capped }).to_string();
        api_request(&vm.api_socket, "PUT", "/vm.resize", Some(body)).await?;

        self.cur_vcpus = capped;
        Ok(capped)
    }

    async fn get_vm_console(&self) -> VmpodResult<PathBuf> {
        Ok(self.vm_ref()?.console_log.clone())
    }

    async fn get_thread_ids(&self) -> VmpodResult<Vec<u32>> {
        let Some(pid) = self.pid() else {
            return Ok(Vec::new());
        };
        let mut tids = Vec::new();
        let task_dir = format!("/proc/{}/task", pid);
        for entry in std::fs::read_dir(task_dir)? {
            if let Ok(tid) = entry?.file_name().to_string_lossy().parse() {
                tids.push(tid);
            }
        }
        Ok(tids)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fs_sharing: true,
            block_hotplug: true,
            memory_probe: false,
            hybrid_vsock: true,
            max_vcpus: self.config.effective_maxvcpus(),
        }
    }

    async fn check(&self) -> VmpodResult<()> {
        let vm = self.vm_ref()?;
        api_request(&vm.api_socket, "GET", "/vmm.ping", None)
            .await
            .map(|_| ())
    }

    fn save_state(&self) -> VmpodResult<HypervisorState> {
        let vm = self.vm_ref()?;
        Ok(HypervisorState {
            kind: crate::config::HypervisorKind::CloudHypervisor,
            sandbox_id: vm.sandbox_id.clone(),
            pid: self.pid(),
            api_socket: vm.api_socket.clone(),
            state: self.state,
        })
    }

    fn load_state(&mut self, state: HypervisorState) -> VmpodResult<()> {
        if state.kind != crate::config::HypervisorKind::CloudHypervisor {
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
        // One connection per request; nothing persistent to drop.
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    fn vmm_state(&self) -> VmmState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HypervisorConfig;

    fn test_vm_config(dir: &Path) -> VmConfig {
        VmConfig {
            sandbox_id: "s1".into(),
            vcpus: 1,
            max_vcpus: 4,
            memory_mib: 256,
            memory_slots: 10,
            machine_type: crate::config::MachineType::Q35,
            block_device_driver: crate::config::BlockDeviceDriver::VirtioBlk,
            hypervisor_bin: PathBuf::from("/usr/bin/cloud-hypervisor"),
            jailer_bin: None,
            kernel: PathBuf::from("/opt/vmpod/vmlinux"),
            initrd: Some(PathBuf::from("/opt/vmpod/initrd.img")),
            image: None,
            firmware: None,
            cmdline: "console=hvc0 quiet".into(),
            api_socket: dir.join("api.sock"),
            vsock: Transport::hybrid_vsock(dir.join("agent.sock"), 1024),
            console_log: dir.join("console.log"),
            sandbox_dir: dir.to_path_buf(),
            hugepages: false,
            iommu: false,
        }
    }

    #[tokio::test]
    async fn create_vm_is_configuration_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        assert!(driver.pid().is_none());
        assert_eq!(driver.vmm_state(), VmmState::NotReady);
    }

    #[tokio::test]
    async fn create_payload_includes_boot_and_vsock() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&driver.create_payload().unwrap()).unwrap();
        assert_eq!(payload["cpus"]["boot_vcpus"], 1);
        assert_eq!(payload["cpus"]["max_vcpus"], 4);
        assert_eq!(payload["memory"]["size"], 256u64 * 1024 * 1024);
        assert_eq!(payload["payload"]["cmdline"], "console=hvc0 quiet");
        assert!(payload["vsock"]["socket"].as_str().unwrap().ends_with("agent.sock"));
    }

    #[tokio::test]
    async fn cold_plugged_block_devices_land_in_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        let dev = Device::new(DeviceKind::Block {
            path: PathBuf::from("/dev/loop0"),
            major: 7,
            minor: 0,
            read_only: false,
            fs_type: None,
        });
        driver.add_device(&dev).await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&driver.create_payload().unwrap()).unwrap();
        assert_eq!(payload["disks"][0]["path"], "/dev/loop0");
    }

    #[tokio::test]
    async fn hotplug_remove_of_never_attached_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        let dev = Device::new(DeviceKind::Block {
            path: PathBuf::from("/dev/loop0"),
            major: 7,
            minor: 0,
            read_only: false,
            fs_type: None,
        });
        let err = driver.hotplug_remove(&dev).await.unwrap_err();
        assert_eq!(err.kind(), "DeviceNotAttached");
    }

    #[tokio::test]
    async fn memory_probe_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        let err = driver.resize_memory(4096, 128, true).await.unwrap_err();
        assert_eq!(err.kind(), "NotSupported");
    }

    #[tokio::test]
    async fn memory_shrink_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        // 256 MiB booted; a smaller target never touches the control socket.
        assert_eq!(driver.resize_memory(128, 128, false).await.unwrap(), 256);
    }

    #[tokio::test]
    async fn resize_vcpus_to_zero_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        let err = driver.resize_vcpus(0).await.unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[tokio::test]
    async fn stop_when_already_stopped_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = CloudHypervisorDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();
        driver.state = VmmState::Stopped;

        driver.stop_vm(true).await.unwrap();
    }
}
