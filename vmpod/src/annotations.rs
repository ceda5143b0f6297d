//! Sandbox annotation handling.
//!
//! Orchestrators pass configuration overrides as annotations. Every key
//! parses under strict rules: booleans accept exactly `true`/`false`,
//! unsigned integers reject negatives, and paths must match a
//! caller-configured glob allow-list.

use std::collections::HashMap;
use std::path::PathBuf;

use glob::Pattern;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::assets::AssetKind;
use crate::config::{ContainerType, SandboxConfig, MIN_HYPERVISOR_MEMORY_MIB};

/// Prefix for hypervisor-affecting annotations.
pub const HYPERVISOR_PREFIX: &str = "io.vmpod.config.hypervisor.";
/// Prefix for runtime-policy annotations.
pub const RUNTIME_PREFIX: &str = "io.vmpod.config.runtime.";
/// Prefix for agent-policy annotations.
pub const AGENT_PREFIX: &str = "io.vmpod.config.agent.";

/// Well-known keys that signal whether a workload is the pod sandbox or a
/// container joining it.
const CONTAINER_TYPE_KEYS: &[&str] = &[
    "io.kubernetes.cri.container-type",
    "io.kubernetes.cri-o.ContainerType",
    "io.kubernetes.docker.type",
];

/// Canonicalize the container-type signal from whichever key is present.
pub fn container_type(annotations: &HashMap<String, String>) -> ContainerType {
    for key in CONTAINER_TYPE_KEYS {
        match annotations.get(*key).map(String::as_str) {
            Some("container" | "podcontainer") => return ContainerType::PodContainer,
            Some("sandbox" | "podsandbox") => return ContainerType::PodSandbox,
            _ => {}
        }
    }
    ContainerType::PodSandbox
}

/// Number of CPUs on this host.
pub fn host_cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Apply every recognized annotation to the sandbox configuration.
/// Unknown keys under the vmpod prefixes are rejected; foreign keys are
/// ignored.
pub fn apply_annotations(config: &mut SandboxConfig) -> VmpodResult<()> {
    let annotations = config.annotations.clone();
    let host_cpus = host_cpu_count();

    for (key, value) in &annotations {
        if let Some(name) = key.strip_prefix(HYPERVISOR_PREFIX) {
            apply_hypervisor(config, name, value, host_cpus)?;
        } else if let Some(name) = key.strip_prefix(RUNTIME_PREFIX) {
            apply_runtime(config, name, value)?;
        } else if let Some(name) = key.strip_prefix(AGENT_PREFIX) {
            apply_agent(config, name, value)?;
        }
    }
    Ok(())
}

fn apply_hypervisor(
    config: &mut SandboxConfig,
    name: &str,
    value: &str,
    host_cpus: u32,
) -> VmpodResult<()> {
    let hv = &mut config.hypervisor;
    match name {
        "path" => {
            let path = allowed_path(&config.path_allowlist, name, value)?;
            hv.assets.entry(AssetKind::Hypervisor).or_default().path = Some(path);
        }
        "jailer_path" => {
            let path = allowed_path(&config.path_allowlist, name, value)?;
            hv.assets.entry(AssetKind::Jailer).or_default().path = Some(path);
        }
        "kernel" => {
            let path = allowed_path(&config.path_allowlist, name, value)?;
            hv.assets.entry(AssetKind::Kernel).or_default().path = Some(path);
        }
        "default_vcpus" => {
            let vcpus = parse_u32(name, value)?;
            if vcpus == 0 || vcpus > host_cpus {
                return Err(VmpodError::AnnotationInvalid(format!(
                    "default_vcpus {} outside 1..={}",
                    vcpus, host_cpus
                )));
            }
            hv.default_vcpus = vcpus;
        }
        "default_maxvcpus" => {
            let max = parse_u32(name, value)?;
            if max > host_cpus {
                return Err(VmpodError::AnnotationInvalid(format!(
                    "default_maxvcpus {} above host cpu count {}",
                    max, host_cpus
                )));
            }
            hv.default_maxvcpus = max;
        }
        "default_memory" => {
            let mib = parse_u32(name, value)?;
            if mib < MIN_HYPERVISOR_MEMORY_MIB {
                return Err(VmpodError::AnnotationInvalid(format!(
                    "default_memory {} MiB below minimum {} MiB",
                    mib, MIN_HYPERVISOR_MEMORY_MIB
                )));
            }
            hv.default_memory_mib = mib;
        }
        "memory_slots" => hv.memory_slots = parse_u32(name, value)?,
        "memory_offset" => hv.memory_offset_mib = parse_u32(name, value)?,
        "enable_virtio_mem" => hv.enable_virtio_mem = parse_bool(name, value)?,
        "enable_mem_prealloc" => hv.enable_mem_prealloc = parse_bool(name, value)?,
        "enable_swap" => hv.enable_swap = parse_bool(name, value)?,
        "enable_hugepages" => hv.enable_hugepages = parse_bool(name, value)?,
        "iommu" => hv.iommu = parse_bool(name, value)?,
        "enable_iommu_platform" => hv.enable_iommu_platform = parse_bool(name, value)?,
        "block_device_driver" => hv.block_device_driver = value.parse()?,
        "shared_fs" => hv.shared_fs = value.parse()?,
        "virtio_fs_daemon" => {
            hv.virtio_fs_daemon = allowed_path(&config.path_allowlist, name, value)?;
        }
        "virtio_fs_cache" => hv.virtio_fs_cache = value.to_string(),
        "virtio_fs_cache_size" => hv.virtio_fs_cache_size_mib = parse_u32(name, value)?,
        "virtio_fs_extra_args" => {
            hv.virtio_fs_extra_args = value.split_whitespace().map(String::from).collect();
        }
        "kernel_params" => {
            if !hv.kernel_params.is_empty() {
                hv.kernel_params.push(' ');
            }
            hv.kernel_params.push_str(value);
        }
        "disable_image_nvdimm" => hv.disable_image_nvdimm = parse_bool(name, value)?,
        "hotplug_vfio_on_root_bus" => hv.hotplug_vfio_on_root_bus = parse_bool(name, value)?,
        "pcie_root_port" => hv.pcie_root_port = parse_u32(name, value)?,
        "sgx_epc" => hv.sgx_epc_bytes = parse_binary_si(value)?,
        other => {
            return Err(VmpodError::AnnotationInvalid(format!(
                "unknown hypervisor annotation '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn apply_runtime(config: &mut SandboxConfig, name: &str, value: &str) -> VmpodResult<()> {
    let policy = &mut config.policy;
    match name {
        "disable_guest_seccomp" => policy.disable_guest_seccomp = parse_bool(name, value)?,
        "sandbox_cgroup_only" => policy.sandbox_cgroup_only = parse_bool(name, value)?,
        "disable_new_netns" => policy.disable_new_netns = parse_bool(name, value)?,
        "inter_network_model" => policy.inter_network_model = value.to_string(),
        other => {
            return Err(VmpodError::AnnotationInvalid(format!(
                "unknown runtime annotation '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn apply_agent(config: &mut SandboxConfig, name: &str, value: &str) -> VmpodResult<()> {
    let agent = &mut config.agent;
    match name {
        "kernel_modules" => {
            agent.kernel_modules = value
                .split(';')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        "trace" => agent.trace = parse_bool(name, value)?,
        "container_pipe_size" => agent.container_pipe_size = parse_u32(name, value)?,
        other => {
            return Err(VmpodError::AnnotationInvalid(format!(
                "unknown agent annotation '{}'",
                other
            )))
        }
    }
    Ok(())
}

/// Booleans accept exactly `true` or `false`.
fn parse_bool(name: &str, value: &str) -> VmpodResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(VmpodError::AnnotationInvalid(format!(
            "{}: '{}' is not a boolean",
            name, other
        ))),
    }
}

/// Unsigned integers; negatives and garbage are rejected.
fn parse_u32(name: &str, value: &str) -> VmpodResult<u32> {
    value.trim().parse().map_err(|_| {
        VmpodError::AnnotationInvalid(format!("{}: '{}' is not an unsigned integer", name, value))
    })
}

/// Binary-SI quantity: unsigned decimal with Ki/Mi/Gi/Ti/Pi/Ei suffix.
pub fn parse_binary_si(value: &str) -> VmpodResult<u64> {
    let value = value.trim();
    let err = || VmpodError::AnnotationInvalid(format!("'{}' is not a binary-SI quantity", value));

    let (digits, multiplier) = match value.find(|c: char| !c.is_ascii_digit()) {
        None => (value, 1u64),
        Some(split) => {
            let (digits, suffix) = value.split_at(split);
            let multiplier = match suffix {
                "Ki" => 1u64 << 10,
                "Mi" => 1u64 << 20,
                "Gi" => 1u64 << 30,
                "Ti" => 1u64 << 40,
                "Pi" => 1u64 << 50,
                "Ei" => 1u64 << 60,
                _ => return Err(err()),
            };
            (digits, multiplier)
        }
    };
    if digits.is_empty() {
        return Err(err());
    }
    let base: u64 = digits.parse().map_err(|_| err())?;
    base.checked_mul(multiplier).ok_or_else(err)
}

/// Check an annotation-supplied path against the allow-list.
fn allowed_path(allowlist: &[String], name: &str, value: &str) -> VmpodResult<PathBuf> {
    let allowed = allowlist.iter().any(|pattern| {
        Pattern::new(pattern)
            .map(|p| p.matches(value))
            .unwrap_or(false)
    });
    if !allowed {
        return Err(VmpodError::AnnotationNotAllowed(format!(
            "{} = {}",
            name, value
        )));
    }
    Ok(PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AgentConfig, BlockDeviceDriver, HypervisorConfig, RuntimePolicy, SharedFsKind,
    };

    fn config_with(annotations: &[(&str, &str)], allowlist: &[&str]) -> SandboxConfig {
        SandboxConfig {
            sandbox_id: "s1".into(),
            bundle_path: PathBuf::from("/run/bundle"),
            hypervisor: HypervisorConfig::default(),
            agent: AgentConfig::default(),
            policy: RuntimePolicy::default(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            path_allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
            containers: Vec::new(),
            shm_size: 0,
        }
    }

    #[test]
    fn hypervisor_path_requires_allowlist_match() {
        let mut config = config_with(
            &[("io.vmpod.config.hypervisor.path", "/opt/vmm/bin/x")],
            &[],
        );
        let err = apply_annotations(&mut config).unwrap_err();
        assert_eq!(err.kind(), "AnnotationNotAllowed");

        let mut config = config_with(
            &[("io.vmpod.config.hypervisor.path", "/opt/vmm/bin/x")],
            &["/opt/vmm/bin/*"],
        );
        apply_annotations(&mut config).unwrap();
        assert_eq!(
            config.hypervisor.assets[&AssetKind::Hypervisor]
                .path
                .as_deref(),
            Some(std::path::Path::new("/opt/vmm/bin/x"))
        );
    }

    #[test]
    fn negative_vcpus_is_invalid() {
        let mut config = config_with(&[("io.vmpod.config.hypervisor.default_vcpus", "-1")], &[]);
        let err = apply_annotations(&mut config).unwrap_err();
        assert_eq!(err.kind(), "AnnotationInvalid");
    }

    #[test]
    fn vcpus_above_host_count_is_invalid() {
        let too_many = (host_cpu_count() + 1).to_string();
        let mut config = config_with(
            &[("io.vmpod.config.hypervisor.default_vcpus", too_many.as_str())],
            &[],
        );
        let err = apply_annotations(&mut config).unwrap_err();
        assert_eq!(err.kind(), "AnnotationInvalid");
    }

    #[test]
    fn booleans_accept_exactly_true_false() {
        let mut config = config_with(&[("io.vmpod.config.hypervisor.iommu", "true")], &[]);
        apply_annotations(&mut config).unwrap();
        assert!(config.hypervisor.iommu);

        let mut config = config_with(&[("io.vmpod.config.hypervisor.iommu", "True")], &[]);
        assert_eq!(
            apply_annotations(&mut config).unwrap_err().kind(),
            "AnnotationInvalid"
        );

        let mut config = config_with(&[("io.vmpod.config.hypervisor.iommu", "1")], &[]);
        assert_eq!(
            apply_annotations(&mut config).unwrap_err().kind(),
            "AnnotationInvalid"
        );
    }

    #[test]
    fn enum_annotations_parse() {
        let mut config = config_with(
            &[
                ("io.vmpod.config.hypervisor.block_device_driver", "virtio-scsi"),
                ("io.vmpod.config.hypervisor.shared_fs", "virtio-9p"),
            ],
            &[],
        );
        apply_annotations(&mut config).unwrap();
        assert_eq!(
            config.hypervisor.block_device_driver,
            BlockDeviceDriver::VirtioScsi
        );
        assert_eq!(config.hypervisor.shared_fs, SharedFsKind::Virtio9p);

        let mut config = config_with(
            &[("io.vmpod.config.hypervisor.block_device_driver", "floppy")],
            &[],
        );
        assert_eq!(
            apply_annotations(&mut config).unwrap_err().kind(),
            "AnnotationInvalid"
        );
    }

    #[test]
    fn kernel_params_are_appended() {
        let mut config = config_with(
            &[("io.vmpod.config.hypervisor.kernel_params", "agent.log=debug")],
            &[],
        );
        config.hypervisor.kernel_params = "quiet".into();
        apply_annotations(&mut config).unwrap();
        assert_eq!(config.hypervisor.kernel_params, "quiet agent.log=debug");
    }

    #[test]
    fn binary_si_quantities() {
        assert_eq!(parse_binary_si("64Mi").unwrap(), 64 << 20);
        assert_eq!(parse_binary_si("2Gi").unwrap(), 2u64 << 30);
        assert_eq!(parse_binary_si("123").unwrap(), 123);
        assert_eq!(parse_binary_si("1Ei").unwrap(), 1u64 << 60);

        for bad in ["64M", "-1Mi", "Mi", "1.5Gi", ""] {
            assert!(parse_binary_si(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn agent_kernel_modules_split_on_semicolons() {
        let mut config = config_with(
            &[("io.vmpod.config.agent.kernel_modules", "vfio; i915 ;")],
            &[],
        );
        apply_annotations(&mut config).unwrap();
        assert_eq!(config.agent.kernel_modules, vec!["vfio", "i915"]);
    }

    #[test]
    fn container_type_keys_canonicalize() {
        let mut annotations = HashMap::new();
        assert_eq!(container_type(&annotations), ContainerType::PodSandbox);

        annotations.insert(
            "io.kubernetes.cri.container-type".to_string(),
            "container".to_string(),
        );
        assert_eq!(container_type(&annotations), ContainerType::PodContainer);

        annotations.clear();
        annotations.insert(
            "io.kubernetes.docker.type".to_string(),
            "podsandbox".to_string(),
        );
        assert_eq!(container_type(&annotations), ContainerType::PodSandbox);
    }

    #[test]
    fn foreign_annotations_are_ignored() {
        let mut config = config_with(&[("io.kubernetes.cri.sandbox-name", "web")], &[]);
        apply_annotations(&mut config).unwrap();
    }

    #[test]
    fn unknown_vmpod_annotation_is_invalid() {
        let mut config = config_with(&[("io.vmpod.config.hypervisor.warp_drive", "on")], &[]);
        assert_eq!(
            apply_annotations(&mut config).unwrap_err().kind(),
            "AnnotationInvalid"
        );
    }
}
