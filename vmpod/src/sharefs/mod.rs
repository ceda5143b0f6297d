//! Host-side shared filesystem tree.
//!
//! Three directories per sandbox: `mounts/` is the read-write working
//! copy, `shared/` is a read-only bind of it exported to the guest, and
//! `private/` is scratch for the read-only propagation workaround (remount
//! events do not propagate through the shared-FS daemon, so RO mounts are
//! staged privately and moved in atomically).

pub mod daemon;

pub use daemon::VirtiofsDaemon;

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tokio::sync::watch;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::agent::types::{storage_driver, Storage};
use crate::config::{BlockDeviceDriver, HypervisorConfig, SharedFsKind};
use crate::layout::{guest_paths, SandboxLayout};
use crate::mount::{is_system_mount, is_watchable_destination, is_watchable_source, Mount};

/// Result of sharing one file into the guest tree.
#[derive(Debug)]
pub enum ShareOutcome {
    Shared(SharedFile),
    /// Mount is provided by the guest itself or cannot be shared; the
    /// caller drops it from the spec.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct SharedFile {
    pub unique: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    /// Present for watchable sources: the agent polls instead of relying
    /// on inotify.
    pub storage: Option<Storage>,
}

/// Rootfs sharing result.
#[derive(Debug, Clone)]
pub struct RootfsShare {
    pub guest_path: String,
    pub storages: Vec<Storage>,
    pub host_path: Option<PathBuf>,
}

/// Shared-FS orchestration for one sandbox.
pub struct ShareFsManager {
    sandbox_id: String,
    layout: SandboxLayout,
    kind: SharedFsKind,
    daemon: Option<VirtiofsDaemon>,
}

impl ShareFsManager {
    pub fn new(sandbox_id: &str, layout: SandboxLayout, kind: SharedFsKind) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            layout,
            kind,
            daemon: None,
        }
    }

    pub fn kind(&self) -> SharedFsKind {
        self.kind
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.layout.shared_dir()
    }

    /// Create the tree and flip `shared/` to a read-only view of
    /// `mounts/` so the guest cannot mutate host state.
    pub fn export_tree(&self) -> VmpodResult<()> {
        self.layout.prepare()?;
        if self.kind == SharedFsKind::None {
            return Ok(());
        }
        let mounts = self.layout.mounts_dir();
        let shared = self.layout.shared_dir();
        bind_mount(&mounts, &shared)?;
        remount_readonly(&shared)?;
        Ok(())
    }

    /// Undo [`export_tree`].
    pub fn unexport_tree(&self) {
        if self.kind != SharedFsKind::None {
            umount_detach(&self.layout.shared_dir());
        }
    }

    /// Storage descriptors the agent mounts at sandbox creation: the
    /// shared tree itself, plus the sandbox shm tmpfs when sized.
    pub fn sandbox_storages(&self, shm_size: u64) -> Vec<Storage> {
        let mut storages = Vec::new();

        match self.kind {
            SharedFsKind::VirtioFs | SharedFsKind::VirtioFsNydus => storages.push(Storage {
                driver: storage_driver::VIRTIO_FS.to_string(),
                driver_options: Vec::new(),
                source: self.share_tag(),
                fs_type: "virtiofs".to_string(),
                options: Vec::new(),
                mount_point: "/run/vmpod/shared".to_string(),
            }),
            SharedFsKind::Virtio9p => storages.push(Storage {
                driver: storage_driver::VIRTIO_9P.to_string(),
                driver_options: Vec::new(),
                source: self.share_tag(),
                fs_type: "9p".to_string(),
                options: vec!["trans=virtio".to_string(), "version=9p2000.L".to_string()],
                mount_point: "/run/vmpod/shared".to_string(),
            }),
            SharedFsKind::None => {}
        }

        if shm_size > 0 {
            storages.push(Storage {
                driver: storage_driver::EPHEMERAL.to_string(),
                driver_options: Vec::new(),
                source: "shm".to_string(),
                fs_type: "tmpfs".to_string(),
                options: vec![
                    "noexec".to_string(),
                    "nosuid".to_string(),
                    "nodev".to_string(),
                    "mode=1777".to_string(),
                    format!("size={}", shm_size),
                ],
                mount_point: guest_paths::SHM_DIR.to_string(),
            });
        }

        storages
    }

    /// Virtiofs mount tag for this sandbox.
    pub fn share_tag(&self) -> String {
        "vmpod-shared".to_string()
    }

    // ------------------------------------------------------------------
    // Daemon lifecycle
    // ------------------------------------------------------------------

    /// Launch the shared-FS daemon. Must happen before the VMM boots.
    pub fn start_daemon(&mut self, hv: &HypervisorConfig) -> VmpodResult<()> {
        if !matches!(self.kind, SharedFsKind::VirtioFs | SharedFsKind::VirtioFsNydus) {
            return Ok(());
        }
        let daemon = VirtiofsDaemon::start(
            hv,
            &self.layout.shared_dir(),
            &self.layout.virtiofsd_socket(),
        )?;
        self.daemon = Some(daemon);
        Ok(())
    }

    /// Exit channel of the running daemon, if any.
    pub fn daemon_exit_channel(&self) -> Option<watch::Receiver<bool>> {
        self.daemon.as_ref().map(|d| d.exit_channel())
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.layout.virtiofsd_socket()
    }

    pub async fn stop_daemon(&mut self) {
        if let Some(mut daemon) = self.daemon.take() {
            daemon.stop().await;
        }
    }

    // ------------------------------------------------------------------
    // Per-file sharing
    // ------------------------------------------------------------------

    /// Share one container mount into the guest-visible tree.
    pub fn share_file(&self, cid: &str, mount: &mut Mount) -> VmpodResult<ShareOutcome> {
        if is_system_mount(&mount.destination) {
            tracing::debug!(dest = %mount.destination.display(), "system mount, guest provides it");
            return Ok(ShareOutcome::Ignored);
        }
        if self.kind == SharedFsKind::None {
            tracing::debug!(dest = %mount.destination.display(), "no shared fs, mount ignored");
            return Ok(ShareOutcome::Ignored);
        }

        let meta = std::fs::symlink_metadata(&mount.source).map_err(|e| {
            VmpodError::MountFailed(format!(
                "share source {}: {}",
                mount.source.display(),
                e
            ))
        })?;
        if !meta.is_dir() && !meta.is_file() {
            tracing::debug!(source = %mount.source.display(), "non-regular source, mount ignored");
            return Ok(ShareOutcome::Ignored);
        }

        let unique = self.unique_name(cid, &mount.destination);
        let target = self.layout.mounts_dir().join(&unique);

        if mount.is_read_only() {
            let staging = self.layout.private_dir().join(&unique);
            share_read_only(&mount.source, meta.is_dir(), &target, &staging)?;
        } else {
            prepare_bind_target(meta.is_dir(), &target)?;
            bind_mount(&mount.source, &target)?;
        }

        mount.host_path = Some(target.clone());
        let guest_path = format!("{}/{}", guest_paths::SHARED_DIR, unique);

        // Projected-volume sources carry a marker; single-key flat files
        // (hostname-class) are recognized by destination instead.
        let watchable =
            is_watchable_source(&mount.source) || is_watchable_destination(&mount.destination);
        let storage = if watchable {
            Some(self.watchable_storage(cid, &mount.destination, &guest_path))
        } else {
            None
        };

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            source = %mount.source.display(),
            %guest_path,
            watchable = storage.is_some(),
            "shared file into guest tree"
        );
        Ok(ShareOutcome::Shared(SharedFile {
            unique,
            host_path: target,
            guest_path,
            storage,
        }))
    }

    /// Inverse of [`share_file`]: detach the bind, then remove targets
    /// that exist only as mount anchors. A path that is not mounted is
    /// not an error.
    pub fn unshare_file(&self, mount: &mut Mount) -> VmpodResult<()> {
        let Some(host_path) = mount.host_path.clone() else {
            return Ok(());
        };
        umount_detach_checked(&host_path)?;
        remove_bind_target(&host_path);
        mount.host_path = None;
        Ok(())
    }

    /// The descriptor the agent uses to poll a watchable mount.
    fn watchable_storage(&self, cid: &str, destination: &Path, guest_source: &str) -> Storage {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "volume".to_string());
        Storage {
            driver: storage_driver::WATCHABLE_BIND.to_string(),
            driver_options: Vec::new(),
            source: guest_source.to_string(),
            fs_type: "bind".to_string(),
            options: Vec::new(),
            mount_point: format!("{}/{}/watchable/{}", guest_paths::SHARED_DIR, cid, name),
        }
    }

    // ------------------------------------------------------------------
    // Rootfs sharing
    // ------------------------------------------------------------------

    /// Share a directory-backed rootfs; returns the in-guest `root.path`.
    /// Block-backed rootfs goes through [`block_rootfs_storage`] instead.
    pub fn share_rootfs(
        &self,
        cid: &str,
        rootfs: &crate::mount::RootFs,
    ) -> VmpodResult<RootfsShare> {
        let guest_path = guest_paths::container_rootfs(cid);
        if self.kind == SharedFsKind::None {
            return Ok(RootfsShare {
                guest_path,
                storages: Vec::new(),
                host_path: None,
            });
        }

        let host_root = self.layout.mounts_dir().join(cid).join("rootfs");
        std::fs::create_dir_all(&host_root).map_err(|e| {
            VmpodError::MountFailed(format!(
                "rootfs share dir {}: {}",
                host_root.display(),
                e
            ))
        })?;

        let source = rootfs.target.as_ref().unwrap_or(&rootfs.source);
        bind_mount(source, &host_root)?;

        Ok(RootfsShare {
            guest_path,
            storages: Vec::new(),
            host_path: Some(host_root),
        })
    }

    /// Inverse of [`share_rootfs`].
    pub fn unshare_rootfs(&self, cid: &str) {
        let host_root = self.layout.mounts_dir().join(cid).join("rootfs");
        umount_detach(&host_root);
        let _ = std::fs::remove_dir(&host_root);
        let _ = std::fs::remove_dir(self.layout.mounts_dir().join(cid));
    }

    /// Unique per-share name: container, nonce, and the destination's
    /// final component for debuggability.
    fn unique_name(&self, cid: &str, destination: &Path) -> String {
        let base = destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", cid, &nonce[..8], base)
    }
}

/// Storage descriptor for a block-device-backed rootfs.
pub fn block_rootfs_storage(
    cid: &str,
    driver: BlockDeviceDriver,
    guest_source: &str,
    fs_type: &str,
    options: &[String],
) -> (String, Storage) {
    let guest_path = guest_paths::container_rootfs(cid);
    let storage = Storage {
        driver: match driver {
            BlockDeviceDriver::VirtioBlk | BlockDeviceDriver::VirtioBlkCcw => {
                storage_driver::BLK.to_string()
            }
            BlockDeviceDriver::VirtioMmio => storage_driver::MMIO_BLK.to_string(),
            BlockDeviceDriver::VirtioScsi => storage_driver::SCSI.to_string(),
            BlockDeviceDriver::Nvdimm => storage_driver::NVDIMM.to_string(),
        },
        driver_options: Vec::new(),
        source: guest_source.to_string(),
        fs_type: fs_type.to_string(),
        options: options.to_vec(),
        mount_point: guest_path.clone(),
    };
    (guest_path, storage)
}

// ----------------------------------------------------------------------
// Host mount primitives
// ----------------------------------------------------------------------

/// Create the bind anchor: a directory for directory sources, an empty
/// file otherwise.
fn prepare_bind_target(source_is_dir: bool, target: &Path) -> VmpodResult<()> {
    let result = if source_is_dir {
        std::fs::create_dir_all(target)
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(target).map(|_| ())
    };
    result.map_err(|e| {
        VmpodError::MountFailed(format!("bind target {}: {}", target.display(), e))
    })
}

fn bind_mount(source: &Path, target: &Path) -> VmpodResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        VmpodError::MountFailed(format!(
            "bind {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;
    // Keep propagation private so guest-visible mounts never leak back.
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| VmpodError::MountFailed(format!("private {}: {}", target.display(), e)))
}

fn remount_readonly(target: &Path) -> VmpodResult<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| VmpodError::MountFailed(format!("remount ro {}: {}", target.display(), e)))
}

fn move_mount(source: &Path, target: &Path) -> VmpodResult<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| {
        VmpodError::MountFailed(format!(
            "move {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

fn umount_detach(target: &Path) {
    if let Err(e) = umount2(target, MntFlags::MNT_DETACH) {
        tracing::debug!(target = %target.display(), error = %e, "detach failed");
    }
}

/// Detach that distinguishes "not mounted" (fine) from real failures.
fn umount_detach_checked(target: &Path) -> VmpodResult<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(VmpodError::MountFailed(format!(
            "detach {}: {}",
            target.display(),
            e
        ))),
    }
}

/// Remove a file or directory created purely as a bind anchor. Non-empty
/// directories are left alone.
fn remove_bind_target(target: &Path) {
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            let _ = std::fs::remove_dir(target);
        }
        Ok(meta) if meta.is_file() && meta.len() == 0 => {
            let _ = std::fs::remove_file(target);
        }
        _ => {}
    }
}

/// Read-only sharing: stage privately, flip read-only, move into the
/// exported tree, detach the staging point. All four steps complete or
/// the filesystem is left unchanged.
fn share_read_only(
    source: &Path,
    source_is_dir: bool,
    target: &Path,
    staging: &Path,
) -> VmpodResult<()> {
    prepare_bind_target(source_is_dir, staging)?;
    bind_mount(source, staging).inspect_err(|_| {
        remove_bind_target(staging);
    })?;

    if let Err(e) = remount_readonly(staging) {
        umount_detach(staging);
        remove_bind_target(staging);
        return Err(e);
    }

    if let Err(e) = prepare_bind_target(source_is_dir, target) {
        umount_detach(staging);
        remove_bind_target(staging);
        return Err(e);
    }
    if let Err(e) = move_mount(staging, target) {
        umount_detach(staging);
        remove_bind_target(staging);
        remove_bind_target(target);
        return Err(e);
    }

    umount_detach(staging);
    remove_bind_target(staging);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StoreLayout;
    use crate::mount::MountKind;

    fn manager(kind: SharedFsKind) -> (tempfile::TempDir, ShareFsManager) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(tmp.path()).sandbox("s1");
        layout.prepare().unwrap();
        (tmp, ShareFsManager::new("s1", layout, kind))
    }

    #[test]
    fn system_mounts_are_ignored() {
        let (_tmp, mgr) = manager(SharedFsKind::VirtioFs);
        let mut m = Mount::bind("/proc", "/proc");
        m.kind = MountKind::Proc;
        assert!(matches!(
            mgr.share_file("c1", &mut m).unwrap(),
            ShareOutcome::Ignored
        ));
        assert!(m.host_path.is_none());
    }

    #[test]
    fn everything_is_ignored_without_shared_fs() {
        let (tmp, mgr) = manager(SharedFsKind::None);
        let src = tmp.path().join("data");
        std::fs::create_dir(&src).unwrap();
        let mut m = Mount::bind(&src, "/data");
        assert!(matches!(
            mgr.share_file("c1", &mut m).unwrap(),
            ShareOutcome::Ignored
        ));
    }

    #[test]
    fn missing_source_is_mount_failed() {
        let (_tmp, mgr) = manager(SharedFsKind::VirtioFs);
        let mut m = Mount::bind("/definitely/not/here", "/data");
        let err = mgr.share_file("c1", &mut m).unwrap_err();
        assert_eq!(err.kind(), "MountFailed");
    }

    #[test]
    fn unique_names_embed_container_and_basename() {
        let (_tmp, mgr) = manager(SharedFsKind::VirtioFs);
        let a = mgr.unique_name("c1", Path::new("/etc/config"));
        let b = mgr.unique_name("c1", Path::new("/etc/config"));
        assert!(a.starts_with("c1-"));
        assert!(a.ends_with("-config"));
        assert_ne!(a, b);
    }

    #[test]
    fn rootfs_share_without_shared_fs_returns_guest_path_only() {
        let (_tmp, mgr) = manager(SharedFsKind::None);
        let rootfs = crate::mount::RootFs {
            source: PathBuf::from("/var/lib/img/rootfs"),
            target: None,
            fs_type: "ext4".into(),
            options: Vec::new(),
            mounted: false,
        };
        let share = mgr.share_rootfs("c1", &rootfs).unwrap();
        assert_eq!(share.guest_path, guest_paths::container_rootfs("c1"));
        assert!(share.host_path.is_none());
        assert!(share.storages.is_empty());
    }

    #[test]
    fn sandbox_storages_include_shared_tree_and_shm() {
        let (_tmp, mgr) = manager(SharedFsKind::VirtioFs);
        let storages = mgr.sandbox_storages(64 * 1024 * 1024);
        assert_eq!(storages.len(), 2);
        assert_eq!(storages[0].driver, storage_driver::VIRTIO_FS);
        assert_eq!(storages[0].source, "vmpod-shared");
        assert_eq!(storages[1].driver, storage_driver::EPHEMERAL);
        assert!(storages[1].options.iter().any(|o| o == "size=67108864"));

        let none = manager(SharedFsKind::None).1.sandbox_storages(0);
        assert!(none.is_empty());
    }

    #[test]
    fn block_rootfs_storage_uses_configured_transport() {
        let (guest_path, storage) = block_rootfs_storage(
            "c1",
            BlockDeviceDriver::VirtioBlk,
            "/dev/vda",
            "ext4",
            &[],
        );
        assert_eq!(guest_path, guest_paths::container_rootfs("c1"));
        assert_eq!(storage.driver, storage_driver::BLK);
        assert_eq!(storage.source, "/dev/vda");
        assert_eq!(storage.mount_point, guest_path);
    }

    #[test]
    fn watchable_storage_targets_poll_path() {
        let (_tmp, mgr) = manager(SharedFsKind::VirtioFs);
        let storage = mgr.watchable_storage(
            "c1",
            Path::new("/etc/kube/config"),
            "/run/vmpod/shared/containers/c1-x-config",
        );
        assert_eq!(storage.driver, storage_driver::WATCHABLE_BIND);
        assert_eq!(
            storage.mount_point,
            "/run/vmpod/shared/containers/c1/watchable/config"
        );
    }
}
