//! Runtime control surface.
//!
//! `VmpodRuntime` is the entry point higher-level runtimes call. Each
//! sandbox sits behind its own async mutex: state transitions within a
//! sandbox are serialized on that lane while unrelated sandboxes progress
//! in parallel. The runtime handle itself is cheaply cloneable.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use vmpod_shared::{VmpodError, VmpodResult};

use crate::agent::{AgentClient, ContainerStats, SockAgentClient};
use crate::annotations;
use crate::config::{ContainerConfig, ContainerResources, RuntimeOptions, SandboxConfig};
use crate::container::ContainerState;
use crate::hypervisor::{new_driver, HypervisorDriver};
use crate::layout::StoreLayout;
use crate::persist::{DiskPersistence, Persistence};
use crate::sandbox::{Sandbox, SandboxState};

type SandboxLane = Arc<Mutex<Sandbox>>;

struct RuntimeInner {
    store: StoreLayout,
    persistence: Arc<dyn Persistence>,
    sandboxes: RwLock<HashMap<String, SandboxLane>>,
}

/// Shared handle to the runtime.
#[derive(Clone)]
pub struct VmpodRuntime {
    inner: Arc<RuntimeInner>,
}

impl VmpodRuntime {
    /// Create a runtime persisting under the configured store path.
    pub fn new(options: RuntimeOptions) -> VmpodResult<Self> {
        std::fs::create_dir_all(&options.store_dir).map_err(|e| {
            VmpodError::ConfigInvalid(format!(
                "cannot create store {}: {}",
                options.store_dir.display(),
                e
            ))
        })?;
        let store = StoreLayout::new(options.store_dir.clone());
        let persistence = Arc::new(DiskPersistence::new(store));
        Ok(Self::with_persistence(options, persistence))
    }

    /// Create a runtime with a caller-supplied persistence adapter.
    pub fn with_persistence(options: RuntimeOptions, persistence: Arc<dyn Persistence>) -> Self {
        let store = StoreLayout::new(options.store_dir.clone());
        Self {
            inner: Arc::new(RuntimeInner {
                store,
                persistence,
                sandboxes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &StoreLayout {
        &self.inner.store
    }

    // ------------------------------------------------------------------
    // Sandbox operations
    // ------------------------------------------------------------------

    /// Create a sandbox with the driver and agent derived from its
    /// configuration.
    pub async fn sandbox_create(&self, mut config: SandboxConfig) -> VmpodResult<String> {
        annotations::apply_annotations(&mut config)?;
        config.validate()?;

        let driver = new_driver(config.hypervisor.kind, &config.hypervisor);
        let layout = self.inner.store.sandbox(&config.sandbox_id);
        let transport = if driver.capabilities().hybrid_vsock {
            vmpod_shared::Transport::hybrid_vsock(layout.agent_socket(), 1024)
        } else {
            vmpod_shared::Transport::vsock(3, 1024)
        };
        let agent = Arc::new(SockAgentClient::new(transport, config.agent.clone()));

        self.insert_sandbox(config, driver, agent).await
    }

    /// Create a sandbox with injected driver and agent (tests, embedders
    /// with custom transports). Annotations are still enforced.
    pub async fn sandbox_create_with(
        &self,
        mut config: SandboxConfig,
        driver: Box<dyn HypervisorDriver>,
        agent: Arc<dyn AgentClient>,
    ) -> VmpodResult<String> {
        annotations::apply_annotations(&mut config)?;
        config.validate()?;
        self.insert_sandbox(config, driver, agent).await
    }

    async fn insert_sandbox(
        &self,
        config: SandboxConfig,
        driver: Box<dyn HypervisorDriver>,
        agent: Arc<dyn AgentClient>,
    ) -> VmpodResult<String> {
        let sandbox_id = config.sandbox_id.clone();

        let mut sandboxes = self.inner.sandboxes.write().await;
        if sandboxes.contains_key(&sandbox_id) {
            return Err(VmpodError::AlreadyExists(format!("sandbox {}", sandbox_id)));
        }

        let sandbox = Sandbox::create(
            config,
            &self.inner.store,
            driver,
            agent,
            self.inner.persistence.clone(),
        )?;
        sandboxes.insert(sandbox_id.clone(), Arc::new(Mutex::new(sandbox)));

        tracing::info!(sandbox_id = %sandbox_id, "sandbox created");
        Ok(sandbox_id)
    }

    pub async fn sandbox_start(&self, sandbox_id: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.start().await
    }

    pub async fn sandbox_stop(&self, sandbox_id: &str, force: bool) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.stop(force).await
    }

    pub async fn sandbox_delete(&self, sandbox_id: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        {
            let sandbox = lane.lock().await;
            sandbox.delete()?;
        }
        self.inner.sandboxes.write().await.remove(sandbox_id);
        tracing::info!(sandbox_id, "sandbox deleted");
        Ok(())
    }

    pub async fn sandbox_pause(&self, sandbox_id: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.pause().await
    }

    pub async fn sandbox_resume(&self, sandbox_id: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.resume().await
    }

    pub async fn sandbox_state(&self, sandbox_id: &str) -> VmpodResult<SandboxState> {
        let lane = self.lane(sandbox_id).await?;
        let sandbox = lane.lock().await;
        Ok(sandbox.state())
    }

    /// Fatal-event sweep for one sandbox (shared-FS daemon death).
    pub async fn sandbox_check(&self, sandbox_id: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.ensure_healthy().await
    }

    pub async fn list_sandboxes(&self) -> Vec<String> {
        self.inner.sandboxes.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Container operations
    // ------------------------------------------------------------------

    pub async fn container_create(
        &self,
        sandbox_id: &str,
        config: ContainerConfig,
    ) -> VmpodResult<String> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.create_container(config).await
    }

    pub async fn container_start(&self, sandbox_id: &str, cid: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.start_container(cid).await
    }

    pub async fn container_stop(
        &self,
        sandbox_id: &str,
        cid: &str,
        force: bool,
    ) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.stop_container(cid, force).await
    }

    pub async fn container_delete(&self, sandbox_id: &str, cid: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.delete_container(cid).await
    }

    pub async fn container_pause(&self, sandbox_id: &str, cid: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.pause_container(cid).await
    }

    pub async fn container_resume(&self, sandbox_id: &str, cid: &str) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.resume_container(cid).await
    }

    pub async fn container_state(
        &self,
        sandbox_id: &str,
        cid: &str,
    ) -> VmpodResult<ContainerState> {
        let lane = self.lane(sandbox_id).await?;
        let sandbox = lane.lock().await;
        sandbox.container_state(cid)
    }

    /// Spawn a process in a running container; returns the process token.
    pub async fn container_exec(
        &self,
        sandbox_id: &str,
        cid: &str,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        terminal: bool,
    ) -> VmpodResult<String> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.exec_process(cid, args, env, cwd, terminal).await
    }

    pub async fn container_signal(
        &self,
        sandbox_id: &str,
        cid: &str,
        proc_id: &str,
        signal: u32,
        all: bool,
    ) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.signal_process(cid, proc_id, signal, all).await
    }

    pub async fn container_wait(
        &self,
        sandbox_id: &str,
        cid: &str,
        proc_id: &str,
    ) -> VmpodResult<i32> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.wait_process(cid, proc_id).await
    }

    pub async fn container_stats(
        &self,
        sandbox_id: &str,
        cid: &str,
    ) -> VmpodResult<ContainerStats> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.stats_container(cid).await
    }

    pub async fn container_update(
        &self,
        sandbox_id: &str,
        cid: &str,
        resources: ContainerResources,
    ) -> VmpodResult<()> {
        let lane = self.lane(sandbox_id).await?;
        let mut sandbox = lane.lock().await;
        sandbox.update_container(cid, resources).await
    }

    fn lane_err(sandbox_id: &str) -> VmpodError {
        VmpodError::NotFound(format!("sandbox {}", sandbox_id))
    }

    async fn lane(&self, sandbox_id: &str) -> VmpodResult<SandboxLane> {
        self.inner
            .sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Self::lane_err(sandbox_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_sandbox_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = VmpodRuntime::new(RuntimeOptions {
            store_dir: tmp.path().to_path_buf(),
        })
        .unwrap();

        let err = runtime.sandbox_start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
        assert!(runtime.list_sandboxes().await.is_empty());
    }
}
