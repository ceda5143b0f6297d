//! Per-container state machine and creation sequencing.
//!
//! A container lives inside a sandbox and only ever moves
//! Ready -> Running -> (Paused <-> Running) -> Stopped; Stopped is
//! terminal. Creation acquires host resources in a fixed order and undoes
//! them in reverse on any failure.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::runtime::{MountBuilder, RootBuilder};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::agent::types::{storage_driver, AgentDevice, CreateContainerRequest, Storage};
use crate::agent::AgentClient;
use crate::config::{BlockDeviceDriver, ContainerConfig, MachineType, RuntimePolicy};
use crate::device::{is_skipped_block_major, DeviceId, DeviceKind, DeviceRegistry, GuestAddress};
use crate::hypervisor::HypervisorDriver;
use crate::mount::{Mount, MountKind};
use crate::ocispec::{constrain_spec, ConstrainPolicy};
use crate::sharefs::{block_rootfs_storage, ShareFsManager, ShareOutcome};

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Ready,
    Running,
    Paused,
    Stopped,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Ready => "ready",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopped => "stopped",
        }
    }

    /// Legal transition matrix. Stopped is terminal.
    pub fn can_transition_to(&self, target: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, target),
            (Ready, Running)
                | (Ready, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque token plus host-side details of a guest process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub token: String,
    pub host_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            host_pid: None,
            started_at: Utc::now(),
        }
    }
}

/// One container within a sandbox.
pub struct Container {
    pub config: ContainerConfig,
    pub state: ContainerState,
    pub process: Option<ProcessRecord>,
    /// Exec processes keyed by exec id.
    pub execs: HashMap<String, ProcessRecord>,
    /// Devices this container references, in attach order.
    pub devices: Vec<DeviceId>,
    /// Mounts that were shared into the guest tree (hold host paths).
    pub shared_mounts: Vec<Mount>,
    pub rootfs_guest_path: String,
    /// Filesystem of the block-backed rootfs, when applicable.
    pub rootfs_fs_type: Option<String>,
    rootfs_shared: bool,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.config.container_id
    }

    /// Validated state transition.
    pub fn transition(&mut self, target: ContainerState) -> VmpodResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: {} -> {}",
                self.id(),
                self.state,
                target
            )));
        }
        tracing::info!(container_id = %self.id(), from = %self.state, to = %target, "container transition");
        self.state = target;
        Ok(())
    }
}

/// Everything container creation borrows from its sandbox.
pub struct ContainerCtx<'a> {
    pub sandbox_id: &'a str,
    pub machine_type: MachineType,
    pub block_driver: BlockDeviceDriver,
    pub policy: &'a RuntimePolicy,
    pub guest_selinux_label: Option<String>,
    pub registry: &'a mut DeviceRegistry,
    pub sharefs: &'a ShareFsManager,
    pub driver: &'a mut dyn HypervisorDriver,
    pub agent: &'a dyn AgentClient,
}

/// Resources acquired during create, undone in reverse order on failure.
#[derive(Default)]
struct PendingCleanups {
    devices: Vec<DeviceId>,
    shared_mounts: Vec<Mount>,
    rootfs_cid: Option<String>,
}

impl PendingCleanups {
    /// Best-effort rollback. Each sub-failure is logged; the walk never
    /// aborts early so every acquired resource gets its undo attempt.
    async fn rollback(mut self, ctx: &mut ContainerCtx<'_>) {
        for id in self.devices.iter().rev() {
            if let Err(e) = ctx.registry.detach(id, ctx.driver).await {
                tracing::warn!(device_id = %id, error = %e, "rollback: detach failed");
            }
            ctx.registry.remove(id);
        }
        for mount in self.shared_mounts.iter_mut().rev() {
            if let Err(e) = ctx.sharefs.unshare_file(mount) {
                tracing::warn!(error = %e, "rollback: unshare failed");
            }
        }
        if let Some(cid) = self.rootfs_cid.take() {
            ctx.sharefs.unshare_rootfs(&cid);
        }
    }
}

/// Run the container creation sequence (§ devices, mounts, rootfs, spec,
/// agent) and return the Ready container.
pub async fn create_container(
    mut ctx: ContainerCtx<'_>,
    mut config: ContainerConfig,
) -> VmpodResult<Container> {
    if config.container_id.is_empty() {
        return Err(VmpodError::ConfigInvalid("empty container id".into()));
    }
    let span = tracing::info_span!(
        "container_create",
        sandbox_id = %ctx.sandbox_id,
        container_id = %config.container_id,
    );

    async {
        let mut pending = PendingCleanups::default();
        match create_container_inner(&mut ctx, &mut config, &mut pending).await {
            Ok(container) => Ok(container),
            Err(e) => {
                tracing::warn!(error = %e, "container create failed, rolling back");
                pending.rollback(&mut ctx).await;
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

async fn create_container_inner(
    ctx: &mut ContainerCtx<'_>,
    config: &mut ContainerConfig,
    pending: &mut PendingCleanups,
) -> VmpodResult<Container> {
    let cid = config.container_id.clone();
    let mut storages: Vec<Storage> = Vec::new();
    let mut agent_devices: Vec<AgentDevice> = Vec::new();

    // 1. Rootfs: block-backed when the source is a device node, shared
    //    through the guest tree otherwise.
    let rootfs_block = block_device_numbers(&config.rootfs.source);
    let (rootfs_guest_path, rootfs_fs_type, rootfs_shared) = if let Some((major, minor)) =
        rootfs_block
    {
        let dev_id = ctx.registry.register(DeviceKind::Block {
            path: config.rootfs.source.clone(),
            major,
            minor,
            read_only: false,
            fs_type: Some(config.rootfs.fs_type.clone()),
        });
        ctx.registry.attach(&dev_id, ctx.driver).await?;
        pending.devices.push(dev_id.clone());

        let guest_source = guest_block_source(ctx.registry, &dev_id)?;
        let (guest_path, storage) = block_rootfs_storage(
            &cid,
            ctx.block_driver,
            &guest_source,
            &config.rootfs.fs_type,
            &config.rootfs.options,
        );
        storages.push(storage);
        (guest_path, Some(config.rootfs.fs_type.clone()), false)
    } else {
        let share = ctx.sharefs.share_rootfs(&cid, &config.rootfs)?;
        let shared = share.host_path.is_some();
        if shared {
            pending.rootfs_cid = Some(cid.clone());
        }
        storages.extend(share.storages);
        (share.guest_path, None, shared)
    };

    // 2.-4. Mounts: block-backed bind mounts become devices, the rest go
    //        through the shared tree or guest-side storages.
    let mut ignored_destinations: Vec<PathBuf> = Vec::new();
    let mut rewritten: HashMap<PathBuf, String> = HashMap::new();
    let mut shared_mounts: Vec<Mount> = Vec::new();

    for mount in config.mounts.iter_mut() {
        match mount.kind {
            MountKind::Ephemeral => {
                let guest_path = format!("/run/vmpod/sandbox/ephemeral/{}", basename(mount));
                storages.push(Storage {
                    driver: storage_driver::EPHEMERAL.to_string(),
                    driver_options: Vec::new(),
                    source: "tmpfs".to_string(),
                    fs_type: "tmpfs".to_string(),
                    options: mount.options.clone(),
                    mount_point: guest_path.clone(),
                });
                rewritten.insert(mount.destination.clone(), guest_path);
                continue;
            }
            MountKind::Local => {
                let guest_path = format!("/run/vmpod/sandbox/local/{}", basename(mount));
                storages.push(Storage {
                    driver: storage_driver::LOCAL.to_string(),
                    driver_options: Vec::new(),
                    source: "local".to_string(),
                    fs_type: "local".to_string(),
                    options: mount.options.clone(),
                    mount_point: guest_path.clone(),
                });
                rewritten.insert(mount.destination.clone(), guest_path);
                continue;
            }
            _ => {}
        }

        if let Some((major, minor)) = block_device_numbers(&mount.source) {
            if is_skipped_block_major(major) {
                tracing::info!(source = %mount.source.display(), "removable-media mount skipped");
                ignored_destinations.push(mount.destination.clone());
                continue;
            }
            let dev_id = ctx.registry.new_device(&crate::config::DeviceInfo {
                host_path: mount.source.clone(),
                container_path: mount.destination.clone(),
                dev_type: "b".to_string(),
                major,
                minor,
            })?;
            ctx.registry.attach(&dev_id, ctx.driver).await?;
            pending.devices.push(dev_id.clone());
            mount.block_device = Some(dev_id.as_str().to_string());

            let guest_source = guest_block_source(ctx.registry, &dev_id)?;
            let guest_path = DeviceRegistry::guest_mount_path(&guest_source);
            storages.push(Storage {
                driver: block_storage_driver(ctx.block_driver),
                driver_options: Vec::new(),
                source: guest_source,
                fs_type: String::new(),
                options: mount.options.clone(),
                mount_point: guest_path.clone(),
            });
            rewritten.insert(mount.destination.clone(), guest_path);
            continue;
        }

        match ctx.sharefs.share_file(&cid, mount)? {
            ShareOutcome::Shared(shared) => {
                rewritten.insert(mount.destination.clone(), shared.guest_path.clone());
                if let Some(storage) = shared.storage {
                    storages.push(storage);
                }
                shared_mounts.push(mount.clone());
                pending.shared_mounts.push(mount.clone());
            }
            ShareOutcome::Ignored => {
                ignored_destinations.push(mount.destination.clone());
            }
        }
    }

    // 3. Requested device nodes.
    let mut device_ids: Vec<DeviceId> = Vec::new();
    for info in &config.devices {
        if info.dev_type == "b" && is_skipped_block_major(info.major) {
            tracing::info!(path = %info.host_path.display(), "removable-media device skipped");
            continue;
        }
        device_ids.push(ctx.registry.new_device(info)?);
    }
    let (immediate, delayed) = ctx.registry.split_delayed(&device_ids, ctx.machine_type);

    for id in &immediate {
        ctx.registry.attach(id, ctx.driver).await?;
        pending.devices.push(id.clone());
        if let Some(agent_device) = agent_device_for(ctx.registry, id, config) {
            agent_devices.push(agent_device);
        }
    }

    // 5.-6. Rewrite the guest-bound spec: mount sources, root path, and
    //        the host-only state the guest must never see.
    rewrite_spec_mounts(&mut config.spec, &rewritten, &ignored_destinations)?;
    let root = RootBuilder::default()
        .path(rootfs_guest_path.clone())
        .readonly(false)
        .build()
        .map_err(|e| VmpodError::Internal(format!("root builder: {}", e)))?;
    config.spec.set_root(Some(root));

    constrain_spec(
        &mut config.spec,
        &ConstrainPolicy {
            disable_guest_seccomp: ctx.policy.disable_guest_seccomp,
            vfio_guest_kernel: matches!(ctx.policy.vfio_mode, crate::config::VfioMode::GuestKernel),
            guest_selinux_label: ctx.guest_selinux_label.clone(),
        },
    );

    // 7. Hand the container to the agent.
    let request = CreateContainerRequest {
        container_id: cid.clone(),
        exec_id: cid.clone(),
        storages,
        devices: agent_devices,
        oci_spec: serde_json::to_value(&config.spec)?,
        sandbox_pidns: false,
    };
    ctx.agent.create_container(request).await?;

    // 8. Large-BAR devices attach only after the container exists.
    for id in &delayed {
        ctx.registry.attach(id, ctx.driver).await?;
        pending.devices.push(id.clone());
    }

    // 9. Ready. The pending list becomes the container's cleanup state.
    let devices = std::mem::take(&mut pending.devices);
    pending.shared_mounts.clear();
    pending.rootfs_cid = None;

    Ok(Container {
        config: config.clone(),
        state: ContainerState::Ready,
        process: None,
        execs: HashMap::new(),
        devices,
        shared_mounts,
        rootfs_guest_path,
        rootfs_fs_type,
        rootfs_shared,
    })
}

/// Tear down everything `create_container` acquired, in reverse order.
///
/// With `force`, host unmount errors are logged and swallowed; without
/// it, the first unmount failure aborts the stop with `MountFailed`.
/// Device detach failures are always logged rather than propagated so
/// every resource gets its undo attempt.
pub async fn release_container_resources(
    container: &mut Container,
    ctx: &mut ContainerCtx<'_>,
    force: bool,
) -> VmpodResult<()> {
    for id in container.devices.iter().rev() {
        if let Err(e) = ctx.registry.detach(id, ctx.driver).await {
            tracing::warn!(device_id = %id, error = %e, "detach during stop failed");
        }
    }
    container.devices.clear();

    while let Some(mut mount) = container.shared_mounts.pop() {
        if let Err(e) = ctx.sharefs.unshare_file(&mut mount) {
            if force {
                tracing::warn!(error = %e, "unshare during forced stop failed");
            } else {
                container.shared_mounts.push(mount);
                return Err(e);
            }
        }
    }

    if container.rootfs_shared {
        ctx.sharefs.unshare_rootfs(&container.config.container_id);
        container.rootfs_shared = false;
    }
    Ok(())
}

/// stat() the path; Some((major, minor)) when it is a block device node.
fn block_device_numbers(path: &std::path::Path) -> Option<(i64, i64)> {
    use nix::sys::stat::{stat, SFlag};
    let st = stat(path).ok()?;
    let fmt = st.st_mode & SFlag::S_IFMT.bits();
    if fmt == SFlag::S_IFBLK.bits() {
        let major = nix::sys::stat::major(st.st_rdev) as i64;
        let minor = nix::sys::stat::minor(st.st_rdev) as i64;
        Some((major, minor))
    } else {
        None
    }
}

fn basename(mount: &Mount) -> String {
    mount
        .destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "volume".to_string())
}

fn block_storage_driver(driver: BlockDeviceDriver) -> String {
    match driver {
        BlockDeviceDriver::VirtioBlk | BlockDeviceDriver::VirtioBlkCcw => {
            storage_driver::BLK.to_string()
        }
        BlockDeviceDriver::VirtioMmio => storage_driver::MMIO_BLK.to_string(),
        BlockDeviceDriver::VirtioScsi => storage_driver::SCSI.to_string(),
        BlockDeviceDriver::Nvdimm => storage_driver::NVDIMM.to_string(),
    }
}

/// Guest-side source of an attached block device.
fn guest_block_source(registry: &DeviceRegistry, id: &DeviceId) -> VmpodResult<String> {
    let device = registry
        .get(id)
        .ok_or_else(|| VmpodError::DeviceNotExist(id.to_string()))?;
    match &device.guest {
        Some(GuestAddress::VirtPath(path)) => Ok(path.clone()),
        Some(GuestAddress::PciPath(slot)) => Ok(format!("pci://0000:00:{}.0", slot)),
        Some(GuestAddress::MmioSlot(slot)) => Ok(format!("mmio://{}", slot)),
        Some(GuestAddress::CcwDevno(devno)) => Ok(format!("ccw://{}", devno)),
        None => registry
            .expected_virt_path(id)
            .ok_or_else(|| VmpodError::DeviceNotAttached(id.to_string())),
    }
}

fn agent_device_for(
    registry: &DeviceRegistry,
    id: &DeviceId,
    config: &ContainerConfig,
) -> Option<AgentDevice> {
    let device = registry.get(id)?;
    let vm_path = device.guest.as_ref().and_then(|g| g.vm_path())?;
    let host_path = device_host_path(&device.kind)?;
    let container_path = config
        .devices
        .iter()
        .find(|info| info.host_path == host_path)
        .map(|info| info.container_path.display().to_string())?;
    Some(AgentDevice {
        id: device.id.as_str().to_string(),
        container_path,
        kind: "b".to_string(),
        vm_path,
        options: Vec::new(),
    })
}

fn device_host_path(kind: &DeviceKind) -> Option<PathBuf> {
    match kind {
        DeviceKind::Block { path, .. } => Some(path.clone()),
        DeviceKind::Generic { path, .. } => Some(path.clone()),
        _ => None,
    }
}

/// Rewrite OCI mount sources to their in-guest paths and drop ignored
/// mounts entirely.
fn rewrite_spec_mounts(
    spec: &mut oci_spec::runtime::Spec,
    rewritten: &HashMap<PathBuf, String>,
    ignored: &[PathBuf],
) -> VmpodResult<()> {
    let Some(mounts) = spec.mounts().clone() else {
        return Ok(());
    };

    let mut out = Vec::with_capacity(mounts.len());
    for mount in mounts {
        let dest = mount.destination().clone();
        if ignored.contains(&dest) {
            continue;
        }
        if let Some(new_source) = rewritten.get(&dest) {
            let rebuilt = MountBuilder::default()
                .destination(dest)
                .typ(mount.typ().clone().unwrap_or_else(|| "bind".to_string()))
                .source(PathBuf::from(new_source))
                .options(mount.options().clone().unwrap_or_default())
                .build()
                .map_err(|e| VmpodError::Internal(format!("mount builder: {}", e)))?;
            out.push(rebuilt);
        } else {
            out.push(mount);
        }
    }
    spec.set_mounts(Some(out));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_matrix_matches_lifecycle() {
        use ContainerState::*;
        assert!(Ready.can_transition_to(Running));
        assert!(Ready.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));

        // Stopped is terminal; no shortcuts into Paused.
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Stopped));
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_unchanged() {
        let mut container = Container {
            config: crate::config::ContainerConfig {
                container_id: "c1".into(),
                container_type: Default::default(),
                rootfs: Default::default(),
                mounts: Vec::new(),
                devices: Vec::new(),
                resources: Default::default(),
                spec: Default::default(),
                annotations: Default::default(),
            },
            state: ContainerState::Stopped,
            process: None,
            execs: HashMap::new(),
            devices: Vec::new(),
            shared_mounts: Vec::new(),
            rootfs_guest_path: String::new(),
            rootfs_fs_type: None,
            rootfs_shared: false,
        };

        let err = container.transition(ContainerState::Running).unwrap_err();
        assert_eq!(err.kind(), "StateTransitionInvalid");
        assert_eq!(container.state, ContainerState::Stopped);
    }

    #[test]
    fn regular_file_is_not_a_block_device() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(block_device_numbers(&file).is_none());
        assert!(block_device_numbers(std::path::Path::new("/missing")).is_none());
    }

    #[test]
    fn spec_mount_rewrite_replaces_sources_and_drops_ignored() {
        let mounts = vec![
            MountBuilder::default()
                .destination(PathBuf::from("/data"))
                .typ("bind")
                .source(PathBuf::from("/host/data"))
                .build()
                .unwrap(),
            MountBuilder::default()
                .destination(PathBuf::from("/proc"))
                .typ("proc")
                .source(PathBuf::from("proc"))
                .build()
                .unwrap(),
        ];
        let mut spec = oci_spec::runtime::SpecBuilder::default()
            .mounts(mounts)
            .build()
            .unwrap();

        let mut rewritten = HashMap::new();
        rewritten.insert(
            PathBuf::from("/data"),
            "/run/vmpod/shared/containers/c1-x-data".to_string(),
        );
        let ignored = vec![PathBuf::from("/proc")];

        rewrite_spec_mounts(&mut spec, &rewritten, &ignored).unwrap();

        let mounts = spec.mounts().as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(
            mounts[0].source().as_ref().unwrap(),
            &PathBuf::from("/run/vmpod/shared/containers/c1-x-data")
        );
    }
}
