//! Minimal micro-VM driver (firecracker style).
//!
//! MMIO-only transports, REST control over a unix socket, and a
//! deliberately small feature set: no filesystem sharing, no hotplug after
//! boot, no memory resize. Capability bits report exactly that.

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
use crate::device::{virt_drive_name, Device, DeviceKind, GuestAddress};
use crate::hypervisor::process::VmmProcess;
use crate::hypervisor::{Capabilities, HypervisorDriver, HypervisorState, VmConfig, VmmState};
use crate::layout::remove_socket;

const PROBE_STEP: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One HTTP request over the firecracker API socket.
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
        "{} {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
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
struct InstanceInfo {
    state: String,
}

/// Driver for the minimal micro-VM.
pub struct FirecrackerDriver {
    config: HypervisorConfig,
    vm: Option<VmConfig>,
    process: Option<VmmProcess>,
    state: VmmState,
    /// Drives registered before boot, keyed by device id.
    drives: HashSet<String>,
    next_drive_index: u32,
}

impl FirecrackerDriver {
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            config,
            vm: None,
            process: None,
            state: VmmState::NotReady,
            drives: HashSet::new(),
            next_drive_index: 0,
        }
    }

    fn vm_ref(&self) -> VmpodResult<&VmConfig> {
        self.vm
            .as_ref()
            .ok_or_else(|| VmpodError::ConfigInvalid("create_vm was not called".into()))
    }

    async fn query_state(&self) -> VmpodResult<String> {
        let vm = self.vm_ref()?;
        let body = api_request(&vm.api_socket, "GET", "/", None)
            .await?
            .ok_or_else(|| VmpodError::Internal("empty instance info".into()))?;
        let info: InstanceInfo = serde_json::from_str(&body)?;
        Ok(info.state)
    }

    /// Register a drive with the VMM. Only legal before `InstanceStart`.
    async fn put_drive(
        &mut self,
        dev_id: &str,
        path: &Path,
        read_only: bool,
    ) -> VmpodResult<GuestAddress> {
        let vm = self.vm_ref()?;
        let body = json!({
            "drive_id": dev_id,
            "path_on_host": path,
            "is_root_device": false,
            "is_read_only": read_only,
        })
        .to_string();
        api_request(
            &vm.api_socket,
            "PUT",
            &format!("/drives/{}", dev_id),
            Some(body),
        )
        .await?;

        let index = self.next_drive_index;
        self.next_drive_index += 1;
        self.drives.insert(dev_id.to_string());
        Ok(GuestAddress::VirtPath(format!(
            "/dev/{}",
            virt_drive_name(index)
        )))
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn create_vm(&mut self, config: VmConfig) -> VmpodResult<()> {
        std::fs::create_dir_all(&config.sandbox_dir).map_err(|e| {
            VmpodError::ConfigInvalid(format!(
                "cannot create sandbox dir {}: {}",
                config.sandbox_dir.display(),
                e
            ))
        })?;
        remove_socket(&config.api_socket);

        self.vm = Some(config);
        self.state = VmmState::NotReady;
        Ok(())
    }

    async fn start_vm(&mut self, timeout: Duration) -> VmpodResult<()> {
        let vm = self.vm_ref()?.clone();

        let args = vec![
            "--api-sock".to_string(),
            vm.api_socket.display().to_string(),
        ];
        let process = VmmProcess::spawn("firecracker", &vm.hypervisor_bin, &args)?;
        self.process = Some(process);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match api_request(&vm.api_socket, "GET", "/", None).await {
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

        let machine = json!({
            "vcpu_count": vm.vcpus,
            "mem_size_mib": vm.memory_mib,
        })
        .to_string();
        api_request(&vm.api_socket, "PUT", "/machine-config", Some(machine)).await?;

        let mut boot = json!({
            "kernel_image_path": vm.kernel,
            "boot_args": vm.cmdline,
        });
        if let Some(initrd) = &vm.initrd {
            boot["initrd_path"] = json!(initrd);
        }
        api_request(&vm.api_socket, "PUT", "/boot-source", Some(boot.to_string())).await?;

        if let Transport::HybridVSock { uds, .. } = &vm.vsock {
            let vsock = json!({
                "guest_cid": 3,
                "uds_path": uds,
            })
            .to_string();
            api_request(&vm.api_socket, "PUT", "/vsock", Some(vsock)).await?;
        }

        let observed = self.query_state().await?;
        if observed != "Not started" {
            return Err(VmpodError::VmStartInconsistent(format!(
                "expected Not started after config submission, observed {}",
                observed
            )));
        }
        self.state = VmmState::Created;

        let action = json!({ "action_type": "InstanceStart" }).to_string();
        api_request(&vm.api_socket, "PUT", "/actions", Some(action)).await?;

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
                // Ctrl-Alt-Del is the graceful path this VMM offers.
                let action = json!({ "action_type": "SendCtrlAltDel" }).to_string();
                let _ = api_request(&vm.api_socket, "PUT", "/actions", Some(action)).await;
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
        let body = json!({ "state": "Paused" }).to_string();
        api_request(&vm.api_socket, "PATCH", "/vm", Some(body)).await?;
        self.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_vm(&mut self) -> VmpodResult<()> {
        let vm = self.vm_ref()?;
        let body = json!({ "state": "Resumed" }).to_string();
        api_request(&vm.api_socket, "PATCH", "/vm", Some(body)).await?;
        self.state = VmmState::Running;
        Ok(())
    }

    async fn add_device(&mut self, device: &Device) -> VmpodResult<()> {
        if self.state == VmmState::Running {
            return Err(VmpodError::DeviceAttachFailed(
                "cold-plug requested on a running VM".into(),
            ));
        }
        match &device.kind {
            DeviceKind::Block {
                path, read_only, ..
            } => {
                let (path, read_only, id) =
                    (path.clone(), *read_only, device.id.as_str().to_string());
                self.put_drive(&id, &path, read_only).await.map(|_| ())
            }
            other => Err(VmpodError::DeviceAttachFailed(format!(
                "device kind {:?} is not supported by this VMM",
                other.id_prefix()
            ))),
        }
    }

    async fn hotplug_add(&mut self, device: &Device) -> VmpodResult<GuestAddress> {
        if self.state == VmmState::Running {
            return Err(VmpodError::NotSupported(
                "device hotplug after boot is not supported by this VMM".into(),
            ));
        }
        match &device.kind {
            DeviceKind::Block {
                path, read_only, ..
            } => {
                let (path, read_only, id) =
                    (path.clone(), *read_only, device.id.as_str().to_string());
                self.put_drive(&id, &path, read_only).await
            }
            other => Err(VmpodError::DeviceAttachFailed(format!(
                "device kind {:?} is not supported by this VMM",
                other.id_prefix()
            ))),
        }
    }

    async fn hotplug_remove(&mut self, device: &Device) -> VmpodResult<()> {
        if !self.drives.contains(device.id.as_str()) {
            return Err(VmpodError::DeviceNotAttached(device.id.to_string()));
        }
        if self.state == VmmState::Running {
            return Err(VmpodError::NotSupported(
                "device removal after boot is not supported by this VMM".into(),
            ));
        }
        self.drives.remove(device.id.as_str());
        Ok(())
    }

    async fn resize_memory(
        &mut self,
        target_mib: u32,
        _block_mib: u32,
        probe: bool,
    ) -> VmpodResult<u32> {
        if probe {
            return Err(VmpodError::NotSupported(
                "memory probe is not supported by this VMM".into(),
            ));
        }
        let current = self.vm_ref()?.memory_mib;
        if target_mib <= current {
            return Ok(current);
        }
        Err(VmpodError::NotSupported(
            "memory hotplug is not supported by this VMM".into(),
        ))
    }

    async fn resize_vcpus(&mut self, count: u32) -> VmpodResult<u32> {
        if count == 0 {
            return Err(VmpodError::ConfigInvalid("cannot resize to 0 vcpus".into()));
        }
        let current = self.vm_ref()?.vcpus;
        if count <= current {
            return Ok(current);
        }
        Err(VmpodError::NotSupported(
            "vcpu hotplug is not supported by this VMM".into(),
        ))
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
        Capabilities {
            fs_sharing: false,
            block_hotplug: false,
            memory_probe: false,
            hybrid_vsock: true,
            max_vcpus: self.config.default_vcpus,
        }
    }

    async fn check(&self) -> VmpodResult<()> {
        let vm = self.vm_ref()?;
        api_request(&vm.api_socket, "GET", "/", None).await.map(|_| ())
    }

    fn save_state(&self) -> VmpodResult<HypervisorState> {
        let vm = self.vm_ref()?;
        Ok(HypervisorState {
            kind: crate::config::HypervisorKind::Firecracker,
            sandbox_id: vm.sandbox_id.clone(),
            pid: self.pid(),
            api_socket: vm.api_socket.clone(),
            state: self.state,
        })
    }

    fn load_state(&mut self, state: HypervisorState) -> VmpodResult<()> {
        if state.kind != crate::config::HypervisorKind::Firecracker {
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

    async fn disconnect(&mut self) {}

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
    use crate::config::{BlockDeviceDriver, MachineType};

    fn test_vm_config(dir: &Path) -> VmConfig {
        VmConfig {
            sandbox_id: "s1".into(),
            vcpus: 1,
            max_vcpus: 1,
            memory_mib: 256,
            memory_slots: 0,
            machine_type: MachineType::MicroVm,
            block_device_driver: BlockDeviceDriver::VirtioMmio,
            hypervisor_bin: PathBuf::from("/usr/bin/firecracker"),
            jailer_bin: None,
            kernel: PathBuf::from("/opt/vmpod/vmlinux"),
            initrd: None,
            image: None,
            firmware: None,
            cmdline: "console=ttyS0 reboot=k".into(),
            api_socket: dir.join("fc.sock"),
            vsock: Transport::hybrid_vsock(dir.join("agent.sock"), 1024),
            console_log: dir.join("console.log"),
            sandbox_dir: dir.to_path_buf(),
            hugepages: false,
            iommu: false,
        }
    }

    #[tokio::test]
    async fn capabilities_report_no_hotplug_and_no_fs_sharing() {
        let driver = FirecrackerDriver::new(HypervisorConfig::default());
        let caps = driver.capabilities();
        assert!(!caps.fs_sharing);
        assert!(!caps.block_hotplug);
        assert!(!caps.memory_probe);
        assert!(caps.hybrid_vsock);
    }

    #[tokio::test]
    async fn memory_grow_is_not_supported_but_shrink_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FirecrackerDriver::new(HypervisorConfig::default());
        driver.create_vm(test_vm_config(dir.path())).await.unwrap();

        assert_eq!(driver.resize_memory(128, 128, false).await.unwrap(), 256);
        let err = driver.resize_memory(1024, 128, false).await.unwrap_err();
        assert_eq!(err.kind(), "NotSupported");
        let err = driver.resize_memory(1024, 128, true).await.unwrap_err();
        assert_eq!(err.kind(), "NotSupported");
    }

    #[tokio::test]
    async fn hotplug_remove_of_unknown_drive_is_not_attached() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FirecrackerDriver::new(HypervisorConfig::default());
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
}
