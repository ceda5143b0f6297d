//! Hotplug/resize coordination.
//!
//! Container resource updates change sandbox-level demand; the
//! coordinator turns that into hypervisor resize calls and tells the
//! guest to bring new CPUs and memory online. Shrinking is a logged
//! no-op in both dimensions.

use std::collections::BTreeSet;

use vmpod_shared::VmpodResult;

use crate::agent::types::OnlineCpuMemRequest;
use crate::agent::AgentClient;
use crate::config::ContainerResources;
use crate::hypervisor::HypervisorDriver;

/// Sandbox-level resource demand derived from container requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceDemand {
    pub vcpus: u32,
    pub memory_mib: u32,
}

/// Aggregate per-container demand on top of the sandbox's boot-time base.
///
/// CPU demand is the larger of: the sum of quota-derived whole vCPUs, and
/// the size of the union of all explicit cpusets. Memory is the sum of
/// limits; containers without limits contribute 0.
pub fn aggregate_demand<'a>(
    base_vcpus: u32,
    base_memory_mib: u32,
    containers: impl Iterator<Item = &'a ContainerResources>,
) -> ResourceDemand {
    let mut quota_vcpus = 0u32;
    let mut cpuset_union: BTreeSet<u32> = BTreeSet::new();
    let mut memory_mib = 0u32;

    for resources in containers {
        quota_vcpus += resources.vcpus();
        memory_mib = memory_mib.saturating_add(resources.memory_mib());
        if let Some(set) = resources.cpuset_cpus.as_deref() {
            cpuset_union.extend(parse_cpuset(set));
        }
    }

    let cpu_demand = quota_vcpus.max(cpuset_union.len() as u32);
    ResourceDemand {
        vcpus: base_vcpus + cpu_demand,
        memory_mib: base_memory_mib + memory_mib,
    }
}

/// Expand a cpuset expression (`0-2,7`) into its members.
fn parse_cpuset(set: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in set.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Applies demand changes to one sandbox.
pub struct ResizeCoordinator {
    memory_block_mib: u32,
    last: ResourceDemand,
}

impl ResizeCoordinator {
    pub fn new(memory_block_mib: u32, boot: ResourceDemand) -> Self {
        Self {
            memory_block_mib,
            last: boot,
        }
    }

    pub fn current(&self) -> ResourceDemand {
        self.last
    }

    /// Push the sandbox to `demand`: grow vCPUs and memory through the
    /// driver, then have the agent online the new resources. Lower demand
    /// is a no-op (shrink is not supported).
    pub async fn apply(
        &mut self,
        demand: ResourceDemand,
        driver: &mut dyn HypervisorDriver,
        agent: &dyn AgentClient,
    ) -> VmpodResult<ResourceDemand> {
        let mut onlined = self.last;

        if demand.vcpus > self.last.vcpus {
            onlined.vcpus = driver.resize_vcpus(demand.vcpus).await?;
        } else if demand.vcpus < self.last.vcpus {
            tracing::info!(
                current = self.last.vcpus,
                requested = demand.vcpus,
                "vcpu shrink not supported, keeping current count"
            );
        }

        if demand.memory_mib > self.last.memory_mib {
            onlined.memory_mib = driver
                .resize_memory(demand.memory_mib, self.memory_block_mib, false)
                .await?;
        } else if demand.memory_mib < self.last.memory_mib {
            tracing::info!(
                current_mib = self.last.memory_mib,
                requested_mib = demand.memory_mib,
                "memory shrink not supported, keeping current size"
            );
        }

        if onlined != self.last {
            agent
                .online_cpu_mem(OnlineCpuMemRequest {
                    wait: true,
                    nb_cpus: onlined.vcpus,
                    cpu_only: onlined.memory_mib == self.last.memory_mib,
                })
                .await?;
        }

        self.last = onlined;
        Ok(onlined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::hypervisor::MockHypervisor;

    fn quota(quota: i64, period: u64) -> ContainerResources {
        ContainerResources {
            cpu_quota: Some(quota),
            cpu_period: Some(period),
            ..Default::default()
        }
    }

    #[test]
    fn quota_sum_and_cpuset_union_take_the_larger() {
        let a = quota(150_000, 100_000); // 2 vcpus
        let b = ContainerResources {
            cpuset_cpus: Some("0-3".into()), // 4 cpus
            ..Default::default()
        };
        let demand = aggregate_demand(1, 256, [&a, &b].into_iter());
        assert_eq!(demand.vcpus, 1 + 4);

        let c = quota(600_000, 100_000); // 6 vcpus beats the union
        let demand = aggregate_demand(1, 256, [&c, &b].into_iter());
        assert_eq!(demand.vcpus, 1 + 6);
    }

    #[test]
    fn overlapping_cpusets_count_once() {
        let a = ContainerResources {
            cpuset_cpus: Some("0-2".into()),
            ..Default::default()
        };
        let b = ContainerResources {
            cpuset_cpus: Some("2,3".into()),
            ..Default::default()
        };
        let demand = aggregate_demand(0, 0, [&a, &b].into_iter());
        assert_eq!(demand.vcpus, 4);
    }

    #[test]
    fn memory_sums_only_limited_containers() {
        let a = ContainerResources {
            memory_limit_bytes: Some(512 * 1024 * 1024),
            ..Default::default()
        };
        let b = ContainerResources::default();
        let demand = aggregate_demand(1, 1024, [&a, &b].into_iter());
        assert_eq!(demand.memory_mib, 1024 + 512);
    }

    #[tokio::test]
    async fn grow_issues_one_resize_and_onlines_guest_resources() {
        let mut driver = MockHypervisor::new();
        let log = driver.call_log();
        let agent = MockAgent::new();

        let boot = ResourceDemand {
            vcpus: 1,
            memory_mib: 1024,
        };
        // Seed the mock with the boot-time size.
        driver
            .resize_memory(1024, 128, false)
            .await
            .ok();
        driver.resize_vcpus(1).await.unwrap();
        log.lock().clear();

        let mut coordinator = ResizeCoordinator::new(128, boot);
        let result = coordinator
            .apply(
                ResourceDemand {
                    vcpus: 1,
                    memory_mib: 4096,
                },
                &mut driver,
                &agent,
            )
            .await
            .unwrap();

        assert_eq!(result.memory_mib, 4096);
        let calls = log.lock().clone();
        assert_eq!(calls, vec!["resize_memory:4096"]);
        // Memory changed, so the guest onlines more than CPUs alone.
        assert_eq!(agent.calls(), vec!["OnlineCpuMem:1:false"]);
    }

    #[tokio::test]
    async fn lower_demand_is_a_noop() {
        let mut driver = MockHypervisor::new();
        let log = driver.call_log();
        let agent = MockAgent::new();

        let mut coordinator = ResizeCoordinator::new(
            128,
            ResourceDemand {
                vcpus: 4,
                memory_mib: 4096,
            },
        );
        let result = coordinator
            .apply(
                ResourceDemand {
                    vcpus: 2,
                    memory_mib: 1024,
                },
                &mut driver,
                &agent,
            )
            .await
            .unwrap();

        assert_eq!(
            result,
            ResourceDemand {
                vcpus: 4,
                memory_mib: 4096,
            }
        );
        assert!(log.lock().is_empty());
        assert!(agent.calls().is_empty());
    }
}
