//! Guest-bound OCI spec pruning.
//!
//! The copy of the spec sent into the guest must not carry host-only
//! state: hooks run on the host, cgroup limits other than CPU belong to
//! the host cgroup manager, namespace paths refer to host namespaces, and
//! the guest has no topology to map `cpus`/`mems` onto.

use oci_spec::runtime::{
    Linux, LinuxDeviceType, LinuxNamespace, LinuxNamespaceType, LinuxResources, Spec,
};

/// Policy knobs that affect pruning.
#[derive(Debug, Clone, Default)]
pub struct ConstrainPolicy {
    pub disable_guest_seccomp: bool,
    /// VFIO devices are claimed by the guest kernel; `/dev/vfio/*` char
    /// nodes must not reach the workload.
    pub vfio_guest_kernel: bool,
    /// Guest SELinux process label; `None` means SELinux is disabled in
    /// the guest.
    pub guest_selinux_label: Option<String>,
}

/// Prune a guest-bound spec in place.
pub fn constrain_spec(spec: &mut Spec, policy: &ConstrainPolicy) {
    spec.set_hooks(None);

    let Some(linux) = spec.linux().clone() else {
        constrain_process(spec, policy);
        return;
    };
    let mut linux = linux;

    constrain_resources(&mut linux);
    constrain_namespaces(&mut linux);

    if policy.disable_guest_seccomp {
        linux.set_seccomp(None);
    }

    if policy.vfio_guest_kernel {
        strip_vfio_devices(&mut linux);
    }

    match &policy.guest_selinux_label {
        None => {
            linux.set_mount_label(None);
        }
        Some(label) => {
            if let Some(mount_label) = linux.mount_label().clone() {
                linux.set_mount_label(Some(replace_selinux_type(&mount_label, label)));
            }
        }
    }

    spec.set_linux(Some(linux));
    constrain_process(spec, policy);
}

fn constrain_process(spec: &mut Spec, policy: &ConstrainPolicy) {
    let Some(process) = spec.process().clone() else {
        return;
    };
    let mut process = process;
    match &policy.guest_selinux_label {
        None => {
            process.set_selinux_label(None);
        }
        Some(label) => {
            if let Some(current) = process.selinux_label().clone() {
                process.set_selinux_label(Some(replace_selinux_type(&current, label)));
            }
        }
    }
    spec.set_process(Some(process));
}

/// Drop every limit the guest cannot honor; CPU quota and memory stay
/// because the agent sizes guest cgroups from them.
fn constrain_resources(linux: &mut Linux) {
    let Some(resources) = linux.resources().clone() else {
        return;
    };
    let mut resources: LinuxResources = resources;

    resources.set_devices(None);
    resources.set_pids(None);
    resources.set_block_io(None);
    resources.set_network(None);
    resources.set_rdma(None);
    resources.set_hugepage_limits(None);

    if let Some(cpu) = resources.cpu().clone() {
        let mut cpu = cpu;
        cpu.set_cpus(None);
        cpu.set_mems(None);
        resources.set_cpu(Some(cpu));
    }

    linux.set_resources(Some(resources));
}

/// Host namespace paths have no meaning in the guest. Cgroup and network
/// entries survive (the host network namespace is already applied).
fn constrain_namespaces(linux: &mut Linux) {
    let Some(namespaces) = linux.namespaces().clone() else {
        return;
    };
    let kept: Vec<LinuxNamespace> = namespaces
        .into_iter()
        .filter(|ns| {
            let has_path = ns.path().as_ref().map_or(false, |p| !p.as_os_str().is_empty());
            !has_path
                || matches!(
                    ns.typ(),
                    LinuxNamespaceType::Cgroup | LinuxNamespaceType::Network
                )
        })
        .collect();
    linux.set_namespaces(Some(kept));
}

/// Remove `/dev/vfio/*` char devices when the guest kernel owns them.
fn strip_vfio_devices(linux: &mut Linux) {
    if let Some(devices) = linux.devices().clone() {
        let kept: Vec<_> = devices
            .into_iter()
            .filter(|d| {
                let is_vfio_char = matches!(
                    d.typ(),
                    LinuxDeviceType::C | LinuxDeviceType::U
                ) && d.path().starts_with("/dev/vfio");
                !is_vfio_char
            })
            .collect();
        linux.set_devices(Some(kept));
    }
}

/// Replace the type component of an SELinux label (`user:role:type:level`)
/// with the type from `template`, mapping a KVM domain to its container
/// counterpart.
fn replace_selinux_type(label: &str, template: &str) -> String {
    let template_type = template.split(':').nth(2);
    let mut parts: Vec<&str> = label.split(':').collect();
    if let (Some(new_type), true) = (template_type, parts.len() >= 3) {
        parts[2] = new_type;
    }
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{
        HooksBuilder, LinuxBuilder, LinuxCpuBuilder, LinuxDeviceBuilder,
        LinuxNamespaceBuilder, LinuxPidsBuilder, LinuxResourcesBuilder, ProcessBuilder,
        SpecBuilder,
    };
    use std::path::PathBuf;

    fn spec_with_everything() -> Spec {
        let cpu = LinuxCpuBuilder::default()
            .quota(100_000i64)
            .period(100_000u64)
            .cpus("0-3")
            .mems("0")
            .build()
            .unwrap();
        let resources = LinuxResourcesBuilder::default()
            .cpu(cpu)
            .pids(LinuxPidsBuilder::default().limit(100i64).build().unwrap())
            .build()
            .unwrap();
        let namespaces = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Mount)
                .build()
                .unwrap(),
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .path(PathBuf::from("/proc/1/ns/pid"))
                .build()
                .unwrap(),
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path(PathBuf::from("/var/run/netns/pod"))
                .build()
                .unwrap(),
        ];
        let devices = vec![
            LinuxDeviceBuilder::default()
                .path(PathBuf::from("/dev/vfio/12"))
                .typ(LinuxDeviceType::C)
                .major(10i64)
                .minor(196i64)
                .build()
                .unwrap(),
            LinuxDeviceBuilder::default()
                .path(PathBuf::from("/dev/null"))
                .typ(LinuxDeviceType::C)
                .major(1i64)
                .minor(3i64)
                .build()
                .unwrap(),
        ];
        let linux = LinuxBuilder::default()
            .resources(resources)
            .namespaces(namespaces)
            .devices(devices)
            .mount_label("system_u:object_r:svirt_sandbox_file_t:s0")
            .build()
            .unwrap();
        let process = ProcessBuilder::default()
            .selinux_label("system_u:system_r:svirt_kvm_net_t:s0")
            .build()
            .unwrap();
        SpecBuilder::default()
            .hooks(HooksBuilder::default().build().unwrap())
            .linux(linux)
            .process(process)
            .build()
            .unwrap()
    }

    #[test]
    fn hooks_are_cleared() {
        let mut spec = spec_with_everything();
        constrain_spec(&mut spec, &ConstrainPolicy::default());
        assert!(spec.hooks().is_none());
    }

    #[test]
    fn non_cpu_resources_are_cleared_and_cpu_topology_dropped() {
        let mut spec = spec_with_everything();
        constrain_spec(&mut spec, &ConstrainPolicy::default());

        let linux = spec.linux().as_ref().unwrap();
        let resources = linux.resources().as_ref().unwrap();
        assert!(resources.pids().is_none());
        assert!(resources.devices().is_none());
        assert!(resources.block_io().is_none());
        assert!(resources.network().is_none());

        let cpu = resources.cpu().as_ref().unwrap();
        assert!(cpu.cpus().is_none());
        assert!(cpu.mems().is_none());
        // Quota survives: the agent sizes the guest cgroup with it.
        assert_eq!(cpu.quota().as_ref().copied(), Some(100_000));
    }

    #[test]
    fn pathless_namespaces_survive_and_host_paths_drop() {
        let mut spec = spec_with_everything();
        constrain_spec(&mut spec, &ConstrainPolicy::default());

        let namespaces = spec
            .linux()
            .as_ref()
            .unwrap()
            .namespaces()
            .as_ref()
            .unwrap();
        let types: Vec<_> = namespaces.iter().map(|n| n.typ()).collect();
        assert!(types.contains(&LinuxNamespaceType::Mount));
        assert!(types.contains(&LinuxNamespaceType::Network));
        assert!(!types.contains(&LinuxNamespaceType::Pid));
    }

    #[test]
    fn vfio_devices_stripped_in_guest_kernel_mode() {
        let mut spec = spec_with_everything();
        constrain_spec(
            &mut spec,
            &ConstrainPolicy {
                vfio_guest_kernel: true,
                ..Default::default()
            },
        );

        let devices = spec.linux().as_ref().unwrap().devices().as_ref().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path(), &PathBuf::from("/dev/null"));
    }

    #[test]
    fn vfio_devices_kept_in_passthrough_mode() {
        let mut spec = spec_with_everything();
        constrain_spec(&mut spec, &ConstrainPolicy::default());
        let devices = spec.linux().as_ref().unwrap().devices().as_ref().unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn selinux_labels_cleared_when_guest_selinux_disabled() {
        let mut spec = spec_with_everything();
        constrain_spec(&mut spec, &ConstrainPolicy::default());

        assert!(spec
            .process()
            .as_ref()
            .unwrap()
            .selinux_label()
            .is_none());
        assert!(spec.linux().as_ref().unwrap().mount_label().is_none());
    }

    #[test]
    fn selinux_type_component_is_replaced() {
        let mut spec = spec_with_everything();
        constrain_spec(
            &mut spec,
            &ConstrainPolicy {
                guest_selinux_label: Some("system_u:system_r:container_t:s0".into()),
                ..Default::default()
            },
        );

        assert_eq!(
            spec.process().as_ref().unwrap().selinux_label().as_deref(),
            Some("system_u:system_r:container_t:s0")
        );
    }

    #[test]
    fn replace_selinux_type_preserves_other_components() {
        assert_eq!(
            replace_selinux_type(
                "system_u:system_r:svirt_kvm_net_t:s0:c1,c2",
                "x:y:container_t:z"
            ),
            "system_u:system_r:container_t:s0:c1,c2"
        );
    }
}
