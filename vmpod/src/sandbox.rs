//! Sandbox state machine.
//!
//! A sandbox owns exactly one hypervisor driver, one agent client and one
//! shared-FS manager, plus the device registry and container map. All
//! transitions run on the sandbox's serial lane (the runtime wraps each
//! sandbox in a mutex); parallelism exists only across sandboxes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;

use vmpod_shared::{Transport, VmpodError, VmpodResult};

use crate::agent::types::{CreateSandboxRequest, ExecProcessRequest};
use crate::agent::{AgentClient, ContainerStats};
use crate::assets::{AssetKind, AssetResolver};
use crate::cmdline::KernelCmdline;
use crate::config::{
    ContainerConfig, ContainerResources, HypervisorKind, SandboxConfig, SharedFsKind,
};
use crate::container::{
    create_container, release_container_resources, Container, ContainerCtx, ContainerState,
    ProcessRecord,
};
use crate::device::DeviceRegistry;
use crate::hypervisor::{HypervisorDriver, VmConfig};
use crate::layout::{SandboxLayout, StoreLayout};
use crate::persist::{ContainerStateBlob, Persistence, SandboxStateBlob};
use crate::resize::{aggregate_demand, ResizeCoordinator, ResourceDemand};
use crate::sharefs::ShareFsManager;

/// Guest port the agent listens on.
const AGENT_VSOCK_PORT: u32 = 1024;
/// Fixed guest cid used by every sandbox VM.
const GUEST_CID: u32 = 3;

/// Sandbox lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    New,
    Ready,
    Running,
    Paused,
    Stopped,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::New => "new",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Stopped => "stopped",
        }
    }

    /// Legal transition matrix. Stopped is terminal.
    pub fn can_transition_to(&self, target: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, target),
            (New, Ready)
                | (Ready, Running)
                | (Ready, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One pod-VM and the containers inside it.
pub struct Sandbox {
    config: SandboxConfig,
    state: SandboxState,
    layout: SandboxLayout,
    driver: Box<dyn HypervisorDriver>,
    agent: Arc<dyn AgentClient>,
    sharefs: ShareFsManager,
    registry: DeviceRegistry,
    containers: HashMap<String, Container>,
    persistence: Arc<dyn Persistence>,
    resize: ResizeCoordinator,
    agent_url: String,
    sharefs_exit: Option<watch::Receiver<bool>>,
}

impl Sandbox {
    /// Build the sandbox: configuration, subsystems and directories. The
    /// VMM is not launched here; `start` does that.
    /// Annotations are expected to be applied already (the runtime does
    /// that before constructing the driver).
    pub fn create(
        config: SandboxConfig,
        store: &StoreLayout,
        driver: Box<dyn HypervisorDriver>,
        agent: Arc<dyn AgentClient>,
        persistence: Arc<dyn Persistence>,
    ) -> VmpodResult<Self> {
        let _span =
            tracing::info_span!("sandbox_create", sandbox_id = %config.sandbox_id).entered();
        config.validate()?;

        let layout = store.sandbox(&config.sandbox_id);
        layout.prepare()?;

        let sharefs = ShareFsManager::new(
            &config.sandbox_id,
            layout.clone(),
            effective_shared_fs(&config, driver.capabilities().fs_sharing),
        );
        let registry = DeviceRegistry::new(config.hypervisor.block_device_driver);

        let boot = aggregate_demand(
            config.hypervisor.default_vcpus,
            config.hypervisor.default_memory_mib,
            config.containers.iter().map(|c| &c.resources),
        );
        let resize = ResizeCoordinator::new(config.hypervisor.memory_block_mib, boot);

        let vsock = agent_transport(&layout, driver.capabilities().hybrid_vsock);
        let agent_url = vsock.to_uri();

        let mut sandbox = Self {
            config,
            state: SandboxState::New,
            layout,
            driver,
            agent,
            sharefs,
            registry,
            containers: HashMap::new(),
            persistence,
            resize,
            agent_url,
            sharefs_exit: None,
        };
        sandbox.state = SandboxState::Ready;
        Ok(sandbox)
    }

    pub fn id(&self) -> &str {
        &self.config.sandbox_id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn agent_url(&self) -> &str {
        &self.agent_url
    }

    pub fn container_state(&self, cid: &str) -> VmpodResult<ContainerState> {
        self.containers
            .get(cid)
            .map(|c| c.state)
            .ok_or_else(|| VmpodError::NotFound(format!("container {}", cid)))
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    pub fn vmm_pid(&self) -> Option<u32> {
        self.driver.pid()
    }

    /// Devices currently attached (test and introspection surface).
    pub fn attached_devices(&self) -> Vec<String> {
        self.registry
            .attached_ids()
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect()
    }

    pub fn block_indices_in_use(&self) -> u32 {
        self.registry.block_indices_in_use()
    }

    fn transition(&mut self, target: SandboxState) -> VmpodResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: {} -> {}",
                self.id(),
                self.state,
                target
            )));
        }
        tracing::info!(sandbox_id = %self.id(), from = %self.state, to = %target, "sandbox transition");
        self.state = target;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Launch the shared-FS daemon and the VMM, connect the agent, create
    /// the sandbox in the guest and bring up the configured containers.
    /// Any failure rolls the whole chain back.
    pub async fn start(&mut self) -> VmpodResult<()> {
        let span = tracing::info_span!("sandbox_start", sandbox_id = %self.id());
        self.do_start().instrument(span).await
    }

    async fn do_start(&mut self) -> VmpodResult<()> {
        if self.state != SandboxState::Ready {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: start from {}",
                self.id(),
                self.state
            )));
        }

        match self.start_inner().await {
            Ok(()) => {
                self.transition(SandboxState::Running)?;
                self.persist().await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "sandbox start failed, rolling back");
                self.rollback_start().await;
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> VmpodResult<()> {
        self.sharefs.export_tree()?;
        self.sharefs.start_daemon(&self.config.hypervisor)?;
        self.sharefs_exit = self.sharefs.daemon_exit_channel();

        if matches!(
            self.sharefs.kind(),
            SharedFsKind::VirtioFs | SharedFsKind::VirtioFsNydus
        ) {
            let fs_dev = crate::device::Device::new(crate::device::DeviceKind::VirtioFs {
                tag: self.sharefs.share_tag(),
                socket: self.sharefs.daemon_socket(),
            });
            self.driver.add_device(&fs_dev).await?;
        }

        let vm_config = self.build_vm_config()?;
        self.driver.create_vm(vm_config).await?;
        self.persist().await;
        self.driver
            .start_vm(self.config.hypervisor.boot_timeout())
            .await?;

        // The control socket answered; now the agent must.
        self.agent.check().await?;

        self.agent
            .create_sandbox(CreateSandboxRequest {
                sandbox_id: self.id().to_string(),
                hostname: self.id().to_string(),
                dns: Vec::new(),
                storages: self.sharefs.sandbox_storages(self.config.shm_size),
                sandbox_pidns: false,
                kernel_modules: self.config.agent.kernel_modules.clone(),
            })
            .await?;

        for container_config in self.config.containers.clone() {
            self.create_container_locked(container_config).await?;
        }
        Ok(())
    }

    /// Undo a partial start: stop containers, VM, daemon, and leave the
    /// sandbox Ready so the caller may retry or delete.
    async fn rollback_start(&mut self) {
        let ids: Vec<String> = self.containers.keys().cloned().collect();
        for cid in ids {
            if let Some(mut container) = self.containers.remove(&cid) {
                let mut ctx = container_ctx_parts(
                    &self.config,
                    &mut self.registry,
                    &self.sharefs,
                    self.driver.as_mut(),
                    self.agent.as_ref(),
                );
                let _ = release_container_resources(&mut container, &mut ctx, true).await;
            }
        }
        if let Err(e) = self.driver.stop_vm(true).await {
            tracing::warn!(error = %e, "rollback: vm stop failed");
        }
        if let Err(e) = self.driver.cleanup().await {
            tracing::warn!(error = %e, "rollback: driver cleanup failed");
        }
        self.sharefs.stop_daemon().await;
        self.sharefs.unexport_tree();
        self.persist().await;
    }

    fn build_vm_config(&self) -> VmpodResult<VmConfig> {
        let hv = &self.config.hypervisor;
        let resolver = asset_resolver(&self.config);

        let hypervisor_bin = resolver.path(AssetKind::Hypervisor)?;
        let jailer_bin = resolver
            .has(AssetKind::Jailer)
            .then(|| resolver.path(AssetKind::Jailer))
            .transpose()?;
        let kernel = resolver.path(AssetKind::Kernel)?;
        let initrd = resolver
            .has(AssetKind::Initrd)
            .then(|| resolver.path(AssetKind::Initrd))
            .transpose()?;
        let image = resolver
            .has(AssetKind::Image)
            .then(|| resolver.path(AssetKind::Image))
            .transpose()?;
        let firmware = resolver
            .has(AssetKind::Firmware)
            .then(|| resolver.path(AssetKind::Firmware))
            .transpose()?;

        let cmdline = build_cmdline(&self.config);
        let vsock = Transport::parse(&self.agent_url)?;

        let boot = self.resize.current();
        let mut vm = VmConfig::from_sandbox(
            self.id(),
            hv,
            &self.layout,
            hypervisor_bin,
            jailer_bin,
            kernel,
            initrd,
            image,
            firmware,
            cmdline.render(),
            vsock,
        );
        vm.vcpus = boot.vcpus.min(hv.effective_maxvcpus());
        vm.memory_mib = boot.memory_mib;
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Fatal-event check: a shared-FS daemon that died while the sandbox
    /// runs takes the VM down with it.
    pub async fn ensure_healthy(&mut self) -> VmpodResult<()> {
        if self.state != SandboxState::Running {
            return Ok(());
        }
        let daemon_died = self
            .sharefs_exit
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false);
        if daemon_died {
            tracing::error!(sandbox_id = %self.id(), "shared-fs daemon exited, tearing down VM");
            let _ = self.driver.stop_vm(false).await;
            let _ = self.transition(SandboxState::Stopped);
            self.persist().await;
            return Err(VmpodError::SharedFsDaemonFailed(
                "daemon exited while sandbox was running".into(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// Create a container in the running sandbox.
    pub async fn create_container(&mut self, config: ContainerConfig) -> VmpodResult<String> {
        if self.state != SandboxState::Running {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: container create while {}",
                self.id(),
                self.state
            )));
        }
        self.create_container_locked(config).await
    }

    async fn create_container_locked(&mut self, config: ContainerConfig) -> VmpodResult<String> {
        if config.container_id.is_empty() {
            return Err(VmpodError::ConfigInvalid("empty container id".into()));
        }
        if self.containers.contains_key(&config.container_id) {
            return Err(VmpodError::AlreadyExists(format!(
                "container {}",
                config.container_id
            )));
        }

        let ctx = container_ctx_parts(
            &self.config,
            &mut self.registry,
            &self.sharefs,
            self.driver.as_mut(),
            self.agent.as_ref(),
        );
        let container = create_container(ctx, config).await?;
        let cid = container.id().to_string();
        self.containers.insert(cid.clone(), container);
        self.persist().await;
        Ok(cid)
    }

    pub async fn start_container(&mut self, cid: &str) -> VmpodResult<()> {
        let container = self.container_mut(cid)?;
        if container.state != ContainerState::Ready {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: start from {}",
                cid, container.state
            )));
        }
        self.agent.start_container(cid).await?;

        let vmm_pid = self.driver.pid();
        let container = self.container_mut(cid)?;
        let mut record = ProcessRecord::new(cid);
        record.host_pid = vmm_pid;
        container.process = Some(record);
        container.transition(ContainerState::Running)?;
        self.persist().await;
        Ok(())
    }

    /// Stop a container: signal, remove in the guest, release resources.
    /// Stopping a stopped container is a no-op.
    pub async fn stop_container(&mut self, cid: &str, force: bool) -> VmpodResult<()> {
        let mut state = self.container_state(cid)?;
        if state == ContainerState::Stopped {
            // The init process may have exited on its own; release
            // anything the container still holds.
            let mut container = self.containers.remove(cid).expect("presence checked");
            let mut ctx = container_ctx_parts(
                &self.config,
                &mut self.registry,
                &self.sharefs,
                self.driver.as_mut(),
                self.agent.as_ref(),
            );
            let result = release_container_resources(&mut container, &mut ctx, force).await;
            self.containers.insert(cid.to_string(), container);
            return result;
        }
        self.persist().await;

        if state == ContainerState::Paused {
            // Stopped is only reachable from Ready or Running.
            if let Err(e) = self.agent.resume_container(cid).await {
                if !force {
                    return Err(e);
                }
                tracing::warn!(container_id = cid, error = %e, "resume during forced stop failed");
            }
            self.container_mut(cid)?
                .transition(ContainerState::Running)?;
            state = ContainerState::Running;
        }

        if state == ContainerState::Running {
            // SIGKILL the whole container; a process that is already gone
            // is success by the ESRCH rule.
            if let Err(e) = self.agent.signal_process(cid, cid, 9, true).await {
                if !force {
                    return Err(e);
                }
                tracing::warn!(container_id = cid, error = %e, "signal during forced stop failed");
            }
        }

        if let Err(e) = self.destructive_agent_remove(cid, force).await {
            if !force {
                return Err(e);
            }
        }

        let mut container = self
            .containers
            .remove(cid)
            .expect("container presence checked");
        let mut ctx = container_ctx_parts(
            &self.config,
            &mut self.registry,
            &self.sharefs,
            self.driver.as_mut(),
            self.agent.as_ref(),
        );
        let release = release_container_resources(&mut container, &mut ctx, force).await;
        match release {
            Ok(()) => {}
            Err(e) => {
                // Put the container back so a later forced stop can finish.
                self.containers.insert(cid.to_string(), container);
                return Err(e);
            }
        }

        container.transition(ContainerState::Stopped)?;
        self.containers.insert(cid.to_string(), container);
        self.persist().await;
        Ok(())
    }

    /// RemoveContainer with the destructive-path timeout rule: one retry,
    /// then the caller escalates to force.
    async fn destructive_agent_remove(&mut self, cid: &str, force: bool) -> VmpodResult<()> {
        match self.agent.remove_container(cid).await {
            Err(VmpodError::Timeout(_)) => {
                tracing::warn!(container_id = cid, "RemoveContainer timed out, retrying once");
                match self.agent.remove_container(cid).await {
                    Err(VmpodError::Timeout(m)) if !force => Err(VmpodError::Timeout(m)),
                    Err(e) if !force => Err(e),
                    _ => Ok(()),
                }
            }
            Err(e) if !force => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn delete_container(&mut self, cid: &str) -> VmpodResult<()> {
        let state = self.container_state(cid)?;
        if state != ContainerState::Stopped {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: delete while {}",
                cid, state
            )));
        }
        self.containers.remove(cid);
        self.persist().await;
        Ok(())
    }

    pub async fn pause_container(&mut self, cid: &str) -> VmpodResult<()> {
        let state = self.container_state(cid)?;
        if !state.can_transition_to(ContainerState::Paused) {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: pause while {}",
                cid, state
            )));
        }
        self.agent.pause_container(cid).await?;
        self.container_mut(cid)?.transition(ContainerState::Paused)?;
        self.persist().await;
        Ok(())
    }

    pub async fn resume_container(&mut self, cid: &str) -> VmpodResult<()> {
        let state = self.container_state(cid)?;
        if !state.can_transition_to(ContainerState::Running) {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: resume while {}",
                cid, state
            )));
        }
        self.agent.resume_container(cid).await?;
        self.container_mut(cid)?
            .transition(ContainerState::Running)?;
        self.persist().await;
        Ok(())
    }

    /// Start an exec process; returns its process token.
    pub async fn exec_process(
        &mut self,
        cid: &str,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        terminal: bool,
    ) -> VmpodResult<String> {
        let state = self.container_state(cid)?;
        if state != ContainerState::Running {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "container {}: exec while {}",
                cid, state
            )));
        }
        let exec_id = format!("exec-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.agent
            .exec_process(ExecProcessRequest {
                container_id: cid.to_string(),
                exec_id: exec_id.clone(),
                args,
                env,
                cwd,
                terminal,
            })
            .await?;
        self.container_mut(cid)?
            .execs
            .insert(exec_id.clone(), ProcessRecord::new(&exec_id));
        Ok(exec_id)
    }

    pub async fn signal_process(
        &mut self,
        cid: &str,
        exec_id: &str,
        signal: u32,
        all: bool,
    ) -> VmpodResult<()> {
        self.container_state(cid)?;
        self.agent.signal_process(cid, exec_id, signal, all).await
    }

    /// Wait for a process; the init process exiting stops the container.
    pub async fn wait_process(&mut self, cid: &str, exec_id: &str) -> VmpodResult<i32> {
        self.container_state(cid)?;
        let status = self.agent.wait_process(cid, exec_id).await?;
        if exec_id == cid {
            if let Some(container) = self.containers.get_mut(cid) {
                if container.state == ContainerState::Running {
                    container.transition(ContainerState::Stopped)?;
                }
            }
            self.persist().await;
        } else if let Some(container) = self.containers.get_mut(cid) {
            container.execs.remove(exec_id);
        }
        Ok(status)
    }

    pub async fn stats_container(&mut self, cid: &str) -> VmpodResult<ContainerStats> {
        self.container_state(cid)?;
        self.agent.stats_container(cid).await
    }

    /// Resize the sandbox to new container resources, then forward the
    /// per-container cgroup update into the guest.
    pub async fn update_container(
        &mut self,
        cid: &str,
        resources: ContainerResources,
    ) -> VmpodResult<()> {
        self.container_state(cid)?;
        self.container_mut(cid)?.config.resources = resources.clone();

        let demand = aggregate_demand(
            self.config.hypervisor.default_vcpus,
            self.config.hypervisor.default_memory_mib,
            self.containers.values().map(|c| &c.config.resources),
        );
        self.resize
            .apply(demand, self.driver.as_mut(), self.agent.as_ref())
            .await?;

        self.agent.update_container(cid, resources).await?;
        self.persist().await;
        Ok(())
    }

    pub fn current_demand(&self) -> ResourceDemand {
        self.resize.current()
    }

    // ------------------------------------------------------------------
    // Pause / resume / stop / delete
    // ------------------------------------------------------------------

    pub async fn pause(&mut self) -> VmpodResult<()> {
        if self.state != SandboxState::Running {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: pause while {}",
                self.id(),
                self.state
            )));
        }
        self.driver.pause_vm().await?;
        self.transition(SandboxState::Paused)?;
        self.persist().await;
        Ok(())
    }

    pub async fn resume(&mut self) -> VmpodResult<()> {
        if self.state != SandboxState::Paused {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: resume while {}",
                self.id(),
                self.state
            )));
        }
        self.driver.resume_vm().await?;
        self.transition(SandboxState::Running)?;
        self.persist().await;
        Ok(())
    }

    /// Stop the sandbox: containers, guest, VMM, daemon, on-disk state.
    /// Stopping a stopped sandbox is a no-op.
    pub async fn stop(&mut self, force: bool) -> VmpodResult<()> {
        let span = tracing::info_span!("sandbox_stop", sandbox_id = %self.id(), force);
        self.do_stop(force).instrument(span).await
    }

    async fn do_stop(&mut self, force: bool) -> VmpodResult<()> {
        if self.state == SandboxState::Stopped {
            return Ok(());
        }
        self.persist().await;

        let ids: Vec<String> = self.containers.keys().cloned().collect();
        for cid in &ids {
            if let Err(e) = self.stop_container(cid, force).await {
                if !force {
                    return Err(e);
                }
                tracing::warn!(container_id = %cid, error = %e, "container stop during forced sandbox stop failed");
            }
        }

        if self.state == SandboxState::Running {
            // Graceful guest teardown with the destructive-path rule:
            // retry one timeout, then escalate to a forced stop.
            match self.agent.destroy_sandbox().await {
                Err(VmpodError::Timeout(_)) => {
                    tracing::warn!(sandbox_id = %self.id(), "DestroySandbox timed out, retrying once");
                    if let Err(e) = self.agent.destroy_sandbox().await {
                        tracing::warn!(sandbox_id = %self.id(), error = %e, "DestroySandbox failed, forcing VM stop");
                    }
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %self.id(), error = %e, "DestroySandbox failed, forcing VM stop");
                }
                Ok(()) => {}
            }
        }

        self.driver.stop_vm(false).await?;
        self.driver.cleanup().await?;
        self.driver.disconnect().await;

        self.sharefs.stop_daemon().await;
        self.sharefs.unexport_tree();

        self.transition(SandboxState::Stopped)?;
        if let Err(e) = self.persistence.remove(self.id()).await {
            tracing::warn!(error = %e, "failed to remove persisted state");
        }
        self.layout.cleanup()?;
        Ok(())
    }

    /// Delete requires a stopped sandbox; stop already removed the disk
    /// state, so this is the final consistency check.
    pub fn delete(&self) -> VmpodResult<()> {
        if self.state != SandboxState::Stopped {
            return Err(VmpodError::StateTransitionInvalid(format!(
                "sandbox {}: delete while {}",
                self.id(),
                self.state
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize public state and hand it to the persistence adapter.
    /// Persistence failures are logged, never fatal to the operation.
    async fn persist(&self) {
        let blob = self.state_blob();
        match blob.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.persistence.save(self.id(), &bytes).await {
                    tracing::warn!(sandbox_id = %self.id(), error = %e, "state save failed");
                }
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.id(), error = %e, "state serialize failed")
            }
        }
    }

    pub fn state_blob(&self) -> SandboxStateBlob {
        SandboxStateBlob {
            sandbox_id: self.id().to_string(),
            state: self.state,
            agent_url: self.agent_url.clone(),
            vmm_pid: self.driver.pid(),
            api_socket: self.layout.api_socket().display().to_string(),
            containers: self
                .containers
                .values()
                .map(|c| ContainerStateBlob {
                    container_id: c.id().to_string(),
                    state: c.state,
                    host_pid: c.process.as_ref().and_then(|p| p.host_pid),
                    devices: c.devices.iter().map(|d| d.as_str().to_string()).collect(),
                })
                .collect(),
        }
    }

    fn container_mut(&mut self, cid: &str) -> VmpodResult<&mut Container> {
        self.containers
            .get_mut(cid)
            .ok_or_else(|| VmpodError::NotFound(format!("container {}", cid)))
    }
}

/// Split borrows for the container-creation context.
fn container_ctx_parts<'a>(
    config: &'a SandboxConfig,
    registry: &'a mut DeviceRegistry,
    sharefs: &'a ShareFsManager,
    driver: &'a mut dyn HypervisorDriver,
    agent: &'a dyn AgentClient,
) -> ContainerCtx<'a> {
    ContainerCtx {
        sandbox_id: &config.sandbox_id,
        machine_type: config.hypervisor.machine_type,
        block_driver: config.hypervisor.block_device_driver,
        policy: &config.policy,
        guest_selinux_label: config.hypervisor.guest_selinux_label.clone(),
        registry,
        sharefs,
        driver,
        agent,
    }
}

/// Shared-FS flavor after capability clamping: a VMM with no FS sharing
/// forces `none`.
fn effective_shared_fs(config: &SandboxConfig, fs_sharing_supported: bool) -> SharedFsKind {
    if !fs_sharing_supported {
        return SharedFsKind::None;
    }
    config.hypervisor.shared_fs
}

/// Agent transport: hybrid vsock through a host socket where the VMM
/// bridges it, native vsock otherwise.
fn agent_transport(layout: &SandboxLayout, hybrid: bool) -> Transport {
    if hybrid {
        Transport::hybrid_vsock(layout.agent_socket(), AGENT_VSOCK_PORT)
    } else {
        Transport::vsock(GUEST_CID, AGENT_VSOCK_PORT)
    }
}

/// Asset resolver seeded with per-kind defaults and the sandbox overrides.
fn asset_resolver(config: &SandboxConfig) -> AssetResolver {
    let hv = &config.hypervisor;
    let mut resolver = AssetResolver::new(hv.digest_algorithm);

    resolver.set_default(AssetKind::Kernel, "/usr/share/vmpod/vmlinux");
    resolver.set_default(
        AssetKind::Hypervisor,
        match hv.kind {
            HypervisorKind::CloudHypervisor => "/usr/bin/cloud-hypervisor",
            HypervisorKind::Qemu => "/usr/bin/qemu-system-x86_64",
            HypervisorKind::Firecracker => "/usr/bin/firecracker",
        },
    );

    for (kind, entry) in &hv.assets {
        if let Some(path) = &entry.path {
            resolver.set_override(*kind, path.clone());
        }
        if let Some(digest) = &entry.digest {
            resolver.set_digest(*kind, digest.clone());
        }
    }
    resolver
}

/// Kernel command line: driver defaults, debug additions, caller
/// overrides, in that order. Later occurrences shadow earlier ones in the
/// guest kernel; nothing is deduplicated.
fn build_cmdline(config: &SandboxConfig) -> KernelCmdline {
    let hv = &config.hypervisor;
    let mut cmdline = KernelCmdline::new();

    match hv.kind {
        HypervisorKind::CloudHypervisor => {
            cmdline.push("console", "hvc0");
        }
        HypervisorKind::Qemu | HypervisorKind::Firecracker => {
            cmdline.push("console", "ttyS0");
        }
    }
    cmdline.push("reboot", "k").push("panic", "1").push("quiet", "");

    if hv.debug {
        cmdline.push("agent.log", "debug");
        cmdline.push("agent.debug_console", "");
    }

    cmdline.extend_from_str(&hv.kernel_params);
    cmdline
}
