//! On-disk layout of the runtime store.
//!
//! Everything the runtime persists for a sandbox lives under one directory:
//!
//! ```text
//! <store>/
//!   logs/                      runtime log files
//!   <sandbox-id>/
//!     state.json               persisted public state
//!     api.sock                 VMM control socket
//!     agent.sock               hybrid-vsock agent socket
//!     virtiofsd.sock           shared-FS daemon socket
//!     console.log              guest console output
//!     mounts/                  read-write working copy of shared files
//!     shared/                  read-only bind of mounts/, exported to guest
//!     private/                 scratch for the RO-propagation workaround
//! ```

use std::path::{Path, PathBuf};

use vmpod_shared::{VmpodError, VmpodResult};

/// Layout of the store as a whole.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn sandbox(&self, sandbox_id: &str) -> SandboxLayout {
        SandboxLayout {
            root: self.root.join(sandbox_id),
        }
    }
}

/// Layout of one sandbox directory.
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn api_socket(&self) -> PathBuf {
        self.root.join("api.sock")
    }

    pub fn agent_socket(&self) -> PathBuf {
        self.root.join("agent.sock")
    }

    pub fn virtiofsd_socket(&self) -> PathBuf {
        self.root.join("virtiofsd.sock")
    }

    pub fn console_log(&self) -> PathBuf {
        self.root.join("console.log")
    }

    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("mounts")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn private_dir(&self) -> PathBuf {
        self.root.join("private")
    }

    /// Create the sandbox directory tree.
    pub fn prepare(&self) -> VmpodResult<()> {
        for dir in [
            self.root.clone(),
            self.mounts_dir(),
            self.shared_dir(),
            self.private_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                VmpodError::ConfigInvalid(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Remove the sandbox directory and everything under it. Socket paths
    /// may be symlinks; both the link and its target are removed.
    pub fn cleanup(&self) -> VmpodResult<()> {
        for sock in [
            self.api_socket(),
            self.agent_socket(),
            self.virtiofsd_socket(),
        ] {
            remove_socket(&sock);
        }
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| {
                VmpodError::Internal(format!("failed to remove {}: {}", self.root.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// Best-effort socket file removal tolerating symlinks.
pub fn remove_socket(path: &Path) {
    if let Ok(target) = std::fs::read_link(path) {
        let resolved = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new("/")).join(target)
        };
        let _ = std::fs::remove_file(resolved);
    }
    let _ = std::fs::remove_file(path);
}

/// In-guest paths the host manipulates.
pub mod guest_paths {
    /// Directory the shared tree appears at inside the guest.
    pub const SHARED_DIR: &str = "/run/vmpod/shared/containers";
    /// Directory block-backed storage is mounted under inside the guest.
    pub const STORAGE_DIR: &str = "/run/vmpod/storage";
    /// Sandbox /dev/shm mount point inside the guest.
    pub const SHM_DIR: &str = "/run/vmpod/sandbox/shm";

    /// Guest-side path of a container's shared directory entry.
    pub fn container_shared(cid: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/{}", SHARED_DIR, cid)
        } else {
            format!("{}/{}-{}", SHARED_DIR, cid, suffix)
        }
    }

    /// Guest rootfs path for a container.
    pub fn container_rootfs(cid: &str) -> String {
        format!("{}/{}/rootfs", SHARED_DIR, cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_paths_hang_off_store_root() {
        let store = StoreLayout::new("/var/lib/vmpod");
        let sb = store.sandbox("s1");
        assert_eq!(sb.root(), Path::new("/var/lib/vmpod/s1"));
        assert_eq!(sb.api_socket(), Path::new("/var/lib/vmpod/s1/api.sock"));
        assert_eq!(sb.mounts_dir(), Path::new("/var/lib/vmpod/s1/mounts"));
    }

    #[test]
    fn prepare_and_cleanup_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(tmp.path());
        let sb = store.sandbox("s1");
        sb.prepare().unwrap();
        assert!(sb.mounts_dir().is_dir());
        assert!(sb.private_dir().is_dir());

        sb.cleanup().unwrap();
        assert!(!sb.exists());
    }

    #[test]
    fn cleanup_removes_symlinked_socket_and_target() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(tmp.path());
        let sb = store.sandbox("s1");
        sb.prepare().unwrap();

        let target = tmp.path().join("real.sock");
        std::fs::write(&target, b"").unwrap();
        std::os::unix::fs::symlink(&target, sb.api_socket()).unwrap();

        sb.cleanup().unwrap();
        assert!(!target.exists());
        assert!(!sb.exists());
    }

    #[test]
    fn guest_rootfs_path_is_stable() {
        assert_eq!(
            guest_paths::container_rootfs("c1"),
            "/run/vmpod/shared/containers/c1/rootfs"
        );
    }
}
