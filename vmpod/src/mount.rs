//! Mount and rootfs model shared by the container and shared-FS layers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Mount categories the runtime distinguishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    #[default]
    Bind,
    Tmpfs,
    Proc,
    Devpts,
    Block,
    Local,
    Ephemeral,
    Watchable,
}

impl MountKind {
    pub fn from_fs_type(fs_type: &str) -> Self {
        match fs_type {
            "bind" => MountKind::Bind,
            "tmpfs" => MountKind::Tmpfs,
            "proc" => MountKind::Proc,
            "devpts" => MountKind::Devpts,
            "local" => MountKind::Local,
            "ephemeral" => MountKind::Ephemeral,
            _ => MountKind::Bind,
        }
    }
}

/// Group ownership change policy for volumes carrying an FS group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsGroupChangePolicy {
    #[default]
    Always,
    OnRootMismatch,
}

/// One mount requested by a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mount {
    /// Source path on the host.
    pub source: PathBuf,
    /// Destination path inside the container.
    pub destination: PathBuf,
    pub kind: MountKind,
    pub read_only: bool,
    pub options: Vec<String>,
    /// Set when the mount is backed by a registered block device.
    pub block_device: Option<String>,
    pub fs_group: Option<u32>,
    pub fs_group_policy: FsGroupChangePolicy,
    /// Populated once the source is shared into the guest-visible tree.
    pub host_path: Option<PathBuf>,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind: MountKind::Bind,
            ..Default::default()
        }
    }

    pub fn read_only(mut self, ro: bool) -> Self {
        self.read_only = ro;
        if ro && !self.options.iter().any(|o| o == "ro") {
            self.options.push("ro".to_string());
        }
        self
    }

    /// Whether the option list marks this mount read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only || self.options.iter().any(|o| o == "ro")
    }
}

/// Container root filesystem descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    pub source: PathBuf,
    /// Where the rootfs is already mounted on the host, when it is.
    pub target: Option<PathBuf>,
    pub fs_type: String,
    pub options: Vec<String>,
    pub mounted: bool,
}

/// Destinations the guest provides on its own; sharing them is skipped.
const SYSTEM_MOUNT_PREFIXES: &[&str] = &["/proc", "/sys", "/dev"];

/// Destination paths treated as system mounts even outside the prefixes.
const SYSTEM_MOUNT_EXACT: &[&str] = &["/sys/fs/cgroup", "/dev/shm", "/dev/pts", "/dev/mqueue"];

/// True for destinations the guest populates itself.
pub fn is_system_mount(destination: &Path) -> bool {
    let Some(dest) = destination.to_str() else {
        return false;
    };
    SYSTEM_MOUNT_EXACT.iter().any(|m| *m == dest)
        || SYSTEM_MOUNT_PREFIXES
            .iter()
            .any(|p| dest == *p || dest.starts_with(&format!("{}/", p)))
}

/// Source path markers of kubelet-projected volumes whose contents change
/// underneath the container and therefore must be polled in the guest.
const WATCHABLE_SOURCE_MARKERS: &[&str] = &[
    "kubernetes.io~configmap",
    "kubernetes.io~secret",
    "kubernetes.io~downward-api",
    "kubernetes.io~projected",
];

/// True when `source` belongs to the watchable set.
pub fn is_watchable_source(source: &Path) -> bool {
    let Some(src) = source.to_str() else {
        return false;
    };
    WATCHABLE_SOURCE_MARKERS.iter().any(|m| src.contains(m))
}

/// Flat destination files kubelet bind-mounts directly from pod-managed
/// sources (not through a projected-volume directory, so the source path
/// carries no volume marker). Their contents change under the container
/// the same way projected volumes do.
const WATCHABLE_DESTINATIONS: &[&str] = &["/etc/hostname", "/etc/hosts", "/etc/resolv.conf"];

/// True when `destination` is one of the flat files that must be polled
/// in the guest regardless of where its source lives.
pub fn is_watchable_destination(destination: &Path) -> bool {
    let Some(dest) = destination.to_str() else {
        return false;
    };
    WATCHABLE_DESTINATIONS.iter().any(|d| *d == dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_mounts_are_detected() {
        assert!(is_system_mount(Path::new("/proc")));
        assert!(is_system_mount(Path::new("/sys/fs/cgroup")));
        assert!(is_system_mount(Path::new("/sys/fs/cgroup/memory")));
        assert!(is_system_mount(Path::new("/dev/shm")));
        assert!(!is_system_mount(Path::new("/data")));
        assert!(!is_system_mount(Path::new("/procs")));
    }

    #[test]
    fn watchable_sources_match_projected_volumes() {
        assert!(is_watchable_source(Path::new(
            "/var/lib/kubelet/pods/x/volumes/kubernetes.io~configmap/cfg"
        )));
        assert!(is_watchable_source(Path::new(
            "/var/lib/kubelet/pods/x/volumes/kubernetes.io~secret/tok"
        )));
        assert!(!is_watchable_source(Path::new("/etc/hostconf")));
    }

    #[test]
    fn watchable_destinations_match_flat_files() {
        // Kubelet serves these from pod-managed paths without a volume
        // marker in the source, so the destination carries the signal.
        assert!(is_watchable_destination(Path::new("/etc/hostname")));
        assert!(is_watchable_destination(Path::new("/etc/hosts")));
        assert!(is_watchable_destination(Path::new("/etc/resolv.conf")));
        assert!(!is_watchable_destination(Path::new("/etc/hostname.bak")));
        assert!(!is_watchable_destination(Path::new("/data")));
    }

    #[test]
    fn read_only_builder_adds_option() {
        let m = Mount::bind("/src", "/dst").read_only(true);
        assert!(m.is_read_only());
        assert!(m.options.contains(&"ro".to_string()));
    }

    #[test]
    fn ro_option_alone_marks_read_only() {
        let m = Mount {
            options: vec!["rbind".into(), "ro".into()],
            ..Mount::bind("/src", "/dst")
        };
        assert!(m.is_read_only());
    }
}
