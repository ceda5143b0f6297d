//! Recording mock agent for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::agent::types::*;
use crate::agent::AgentClient;
use crate::config::ContainerResources;

#[derive(Default)]
struct MockAgentState {
    calls: Vec<String>,
    containers: Vec<String>,
    copied: Vec<CopyFileRequest>,
    /// Artificial latency applied to CreateContainer.
    create_container_delay: Option<Duration>,
    fail_create_container: Option<String>,
    /// When set, CreateContainer answers with the Timeout error kind, as
    /// the socket client would after its deadline.
    timeout_create_container: bool,
}

/// In-memory agent that records every request.
#[derive(Clone, Default)]
pub struct MockAgent {
    state: Arc<Mutex<MockAgentState>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn created_containers(&self) -> Vec<String> {
        self.state.lock().containers.clone()
    }

    pub fn copied_files(&self) -> Vec<CopyFileRequest> {
        self.state.lock().copied.clone()
    }

    /// Make CreateContainer stall for `delay` before answering.
    pub fn delay_create_container(&self, delay: Duration) {
        self.state.lock().create_container_delay = Some(delay);
    }

    pub fn fail_create_container(&self, message: impl Into<String>) {
        self.state.lock().fail_create_container = Some(message.into());
    }

    pub fn timeout_create_container(&self) {
        self.state.lock().timeout_create_container = true;
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn create_sandbox(&self, req: CreateSandboxRequest) -> VmpodResult<()> {
        self.record(format!("CreateSandbox:{}", req.sandbox_id));
        Ok(())
    }

    async fn destroy_sandbox(&self) -> VmpodResult<()> {
        self.record("DestroySandbox");
        Ok(())
    }

    async fn create_container(&self, req: CreateContainerRequest) -> VmpodResult<()> {
        let (delay, failure, timeout) = {
            let state = self.state.lock();
            (
                state.create_container_delay,
                state.fail_create_container.clone(),
                state.timeout_create_container,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if timeout {
            return Err(VmpodError::Timeout("CreateContainer exceeded budget".into()));
        }
        if let Some(message) = failure {
            return Err(VmpodError::Internal(message));
        }

        self.record(format!("CreateContainer:{}", req.container_id));
        self.state.lock().containers.push(req.container_id);
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> VmpodResult<()> {
        self.record(format!("StartContainer:{}", container_id));
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> VmpodResult<()> {
        self.record(format!("RemoveContainer:{}", container_id));
        self.state.lock().containers.retain(|c| c != container_id);
        Ok(())
    }

    async fn exec_process(&self, req: ExecProcessRequest) -> VmpodResult<()> {
        self.record(format!("ExecProcess:{}:{}", req.container_id, req.exec_id));
        Ok(())
    }

    async fn signal_process(
        &self,
        container_id: &str,
        _exec_id: &str,
        signal: u32,
        all: bool,
    ) -> VmpodResult<()> {
        self.record(format!("SignalProcess:{}:{}:{}", container_id, signal, all));
        Ok(())
    }

    async fn wait_process(&self, container_id: &str, exec_id: &str) -> VmpodResult<i32> {
        self.record(format!("WaitProcess:{}:{}", container_id, exec_id));
        Ok(0)
    }

    async fn pause_container(&self, container_id: &str) -> VmpodResult<()> {
        self.record(format!("PauseContainer:{}", container_id));
        Ok(())
    }

    async fn resume_container(&self, container_id: &str) -> VmpodResult<()> {
        self.record(format!("ResumeContainer:{}", container_id));
        Ok(())
    }

    async fn stats_container(&self, container_id: &str) -> VmpodResult<ContainerStats> {
        self.record(format!("StatsContainer:{}", container_id));
        Ok(ContainerStats {
            cpu_usage_usec: 1000,
            memory_usage_bytes: 4096,
            memory_limit_bytes: 0,
            pids_current: 1,
        })
    }

    async fn update_container(
        &self,
        container_id: &str,
        _resources: ContainerResources,
    ) -> VmpodResult<()> {
        self.record(format!("UpdateContainer:{}", container_id));
        Ok(())
    }

    async fn online_cpu_mem(&self, req: OnlineCpuMemRequest) -> VmpodResult<()> {
        self.record(format!("OnlineCpuMem:{}:{}", req.nb_cpus, req.cpu_only));
        Ok(())
    }

    async fn check(&self) -> VmpodResult<()> {
        self.record("Check");
        Ok(())
    }

    async fn get_oom_event(&self) -> VmpodResult<String> {
        self.record("GetOomEvent");
        Ok(String::new())
    }

    async fn copy_file(&self, req: CopyFileRequest) -> VmpodResult<()> {
        self.record(format!("CopyFile:{}:{}", req.path, req.offset));
        self.state.lock().copied.push(req);
        Ok(())
    }

    async fn read_stdout(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>> {
        self.record(format!("ReadStdout:{}:{}", container_id, exec_id));
        Ok(Vec::new())
    }

    async fn read_stderr(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>> {
        self.record(format!("ReadStderr:{}:{}", container_id, exec_id));
        Ok(Vec::new())
    }
}
