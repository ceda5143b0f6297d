//! Typed device catalog.
//!
//! Every device a sandbox can carry is a tagged variant with a host-side
//! descriptor; the guest-side address is filled in by the hypervisor driver
//! at attach time. Cross-references use stable identifiers, never pointers.

pub mod allocator;
pub mod registry;

pub use allocator::BlockIndexAllocator;
pub use registry::DeviceRegistry;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use vmpod_shared::{VmpodError, VmpodResult};

use crate::config::DeviceInfo;

/// Stable device identifier, unique within a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Mint a new identifier with a kind-derived prefix.
    pub fn generate(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device node class from the OCI device type letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevNodeType {
    Char,
    Block,
    Unbuffered,
    Pipe,
}

impl DevNodeType {
    pub fn parse(letter: &str) -> VmpodResult<Self> {
        match letter {
            "c" => Ok(DevNodeType::Char),
            "b" => Ok(DevNodeType::Block),
            "u" => Ok(DevNodeType::Unbuffered),
            "p" => Ok(DevNodeType::Pipe),
            other => Err(VmpodError::DeviceInvalid(format!(
                "device type '{}' not in {{c, b, u, p}}",
                other
            ))),
        }
    }
}

/// Guest-side address of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAddress {
    /// `/dev/vdX`-style path.
    VirtPath(String),
    /// PCI slot sequence from the root complex, e.g. `0a`.
    PciPath(String),
    /// MMIO transport slot index.
    MmioSlot(u32),
    /// s390x channel device number.
    CcwDevno(String),
}

impl GuestAddress {
    /// Path form the agent understands, when one exists.
    pub fn vm_path(&self) -> Option<String> {
        match self {
            GuestAddress::VirtPath(p) => Some(p.clone()),
            _ => None,
        }
    }
}

/// Host-side descriptor of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeviceKind {
    Block {
        path: PathBuf,
        major: i64,
        minor: i64,
        read_only: bool,
        /// Filesystem on the device, when known (block-backed rootfs).
        fs_type: Option<String>,
    },
    VhostUserBlock {
        socket: PathBuf,
    },
    VfioPci {
        /// Host bus/device/function, `0000:65:00.0` form.
        bdf: String,
        sysfs_path: PathBuf,
        /// Devices with large PCI BARs attach after initial container
        /// creation on Q35-like machines.
        large_bar: bool,
    },
    VfioAp {
        sysfs_path: PathBuf,
    },
    Vsock {
        guest_cid: u32,
        socket: PathBuf,
    },
    VirtioFs {
        tag: String,
        socket: PathBuf,
    },
    VirtioNet {
        tap: String,
        mac: String,
    },
    VirtioSerial {
        socket: PathBuf,
    },
    VirtioRng,
    VirtioConsole {
        socket: PathBuf,
    },
    /// Plain device node passed through the OCI spec; nothing to attach.
    Generic {
        path: PathBuf,
        node_type: DevNodeType,
    },
}

impl DeviceKind {
    /// Identifier prefix for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            DeviceKind::Block { .. } => "blk",
            DeviceKind::VhostUserBlock { .. } => "vublk",
            DeviceKind::VfioPci { .. } => "vfio",
            DeviceKind::VfioAp { .. } => "vfio-ap",
            DeviceKind::Vsock { .. } => "vsock",
            DeviceKind::VirtioFs { .. } => "virtiofs",
            DeviceKind::VirtioNet { .. } => "net",
            DeviceKind::VirtioSerial { .. } => "serial",
            DeviceKind::VirtioRng => "rng",
            DeviceKind::VirtioConsole { .. } => "console",
            DeviceKind::Generic { .. } => "dev",
        }
    }

    /// Whether attaching this device involves the VMM at all.
    pub fn needs_vm_attach(&self) -> bool {
        !matches!(self, DeviceKind::Generic { .. })
    }
}

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
    /// Guest address, present once attached.
    pub guest: Option<GuestAddress>,
    /// Block index held while attached (block devices only).
    pub block_index: Option<u32>,
    /// Containers currently referencing this device.
    pub ref_count: u32,
    pub attached: bool,
}

impl Device {
    pub fn new(kind: DeviceKind) -> Self {
        let id = DeviceId::generate(kind.id_prefix());
        Self {
            id,
            kind,
            guest: None,
            block_index: None,
            ref_count: 0,
            attached: false,
        }
    }
}

/// Linux major numbers of CDROM-class devices.
const CDROM_MAJORS: &[i64] = &[11, 15, 16, 17, 18, 20, 23, 24];

/// Linux major number of the floppy driver.
const FLOPPY_MAJOR: i64 = 2;

/// True for block majors that must never be attached to a sandbox.
pub fn is_skipped_block_major(major: i64) -> bool {
    major == FLOPPY_MAJOR || CDROM_MAJORS.contains(&major)
}

/// Build the typed kind for a caller-requested device node.
pub fn kind_from_info(info: &DeviceInfo) -> VmpodResult<DeviceKind> {
    if info.host_path.as_os_str().is_empty() {
        return Err(VmpodError::DeviceInvalid("empty device path".into()));
    }
    let node_type = DevNodeType::parse(&info.dev_type)?;

    match node_type {
        DevNodeType::Block => Ok(DeviceKind::Block {
            path: info.host_path.clone(),
            major: info.major,
            minor: info.minor,
            read_only: false,
            fs_type: None,
        }),
        DevNodeType::Char | DevNodeType::Unbuffered => {
            if let Some(group) = vfio_group_from_path(&info.host_path) {
                Ok(DeviceKind::VfioPci {
                    bdf: String::new(),
                    sysfs_path: PathBuf::from(format!(
                        "/sys/kernel/iommu_groups/{}/devices",
                        group
                    )),
                    large_bar: false,
                })
            } else {
                Ok(DeviceKind::Generic {
                    path: info.host_path.clone(),
                    node_type,
                })
            }
        }
        DevNodeType::Pipe => Ok(DeviceKind::Generic {
            path: info.host_path.clone(),
            node_type,
        }),
    }
}

/// Extract the IOMMU group number from a `/dev/vfio/<n>` path.
/// The control node `/dev/vfio/vfio` is not a group device.
fn vfio_group_from_path(path: &std::path::Path) -> Option<u32> {
    let s = path.to_str()?;
    let rest = s.strip_prefix("/dev/vfio/")?;
    rest.parse().ok()
}

/// Derive the guest block-device name for an index (`vda`, `vdz`, `vdaa`).
pub fn virt_drive_name(index: u32) -> String {
    let mut i = index as i64;
    let mut name = Vec::new();
    loop {
        name.insert(0, b'a' + (i % 26) as u8);
        i = i / 26 - 1;
        if i < 0 {
            break;
        }
    }
    format!("vd{}", String::from_utf8(name).expect("ascii"))
}
