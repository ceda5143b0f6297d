//! Persistence adapter.
//!
//! The core sees an opaque byte payload and calls the adapter at
//! well-defined commit points: sandbox creation commit, every state
//! transition, and before each destructive step. The default adapter
//! writes a JSON blob under the sandbox directory with write-then-rename.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vmpod_shared::{VmpodError, VmpodResult};

use crate::container::ContainerState;
use crate::layout::StoreLayout;
use crate::sandbox::SandboxState;

/// Narrow persistence interface.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, sandbox_id: &str, blob: &[u8]) -> VmpodResult<()>;
    async fn load(&self, sandbox_id: &str) -> VmpodResult<Vec<u8>>;
    async fn remove(&self, sandbox_id: &str) -> VmpodResult<()>;
}

/// Public state of one container as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStateBlob {
    pub container_id: String,
    pub state: ContainerState,
    pub host_pid: Option<u32>,
    pub devices: Vec<String>,
}

/// Public state of a sandbox as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStateBlob {
    pub sandbox_id: String,
    pub state: SandboxState,
    /// URL of the agent socket, for reconnecting supervisors.
    pub agent_url: String,
    pub vmm_pid: Option<u32>,
    pub api_socket: String,
    pub containers: Vec<ContainerStateBlob>,
}

impl SandboxStateBlob {
    pub fn to_bytes(&self) -> VmpodResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VmpodResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// File-backed persistence under `<store>/<sandbox>/state.json`.
pub struct DiskPersistence {
    store: StoreLayout,
}

impl DiskPersistence {
    pub fn new(store: StoreLayout) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Persistence for DiskPersistence {
    async fn save(&self, sandbox_id: &str, blob: &[u8]) -> VmpodResult<()> {
        let layout = self.store.sandbox(sandbox_id);
        let state_file = layout.state_file();
        if let Some(parent) = state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename keeps the blob atomic against crashes.
        let tmp = state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &state_file).await?;
        Ok(())
    }

    async fn load(&self, sandbox_id: &str) -> VmpodResult<Vec<u8>> {
        let state_file = self.store.sandbox(sandbox_id).state_file();
        tokio::fs::read(&state_file).await.map_err(|e| {
            VmpodError::NotFound(format!("state of sandbox {}: {}", sandbox_id, e))
        })
    }

    async fn remove(&self, sandbox_id: &str) -> VmpodResult<()> {
        let state_file = self.store.sandbox(sandbox_id).state_file();
        match tokio::fs::remove_file(&state_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory persistence for tests.
#[derive(Default)]
pub struct MemoryPersistence {
    blobs: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, sandbox_id: &str, blob: &[u8]) -> VmpodResult<()> {
        self.blobs
            .lock()
            .insert(sandbox_id.to_string(), blob.to_vec());
        Ok(())
    }

    async fn load(&self, sandbox_id: &str) -> VmpodResult<Vec<u8>> {
        self.blobs
            .lock()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| VmpodError::NotFound(format!("state of sandbox {}", sandbox_id)))
    }

    async fn remove(&self, sandbox_id: &str) -> VmpodResult<()> {
        self.blobs.lock().remove(sandbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> SandboxStateBlob {
        SandboxStateBlob {
            sandbox_id: "s1".into(),
            state: SandboxState::Running,
            agent_url: "hvsock:///run/vmpod/s1/agent.sock:1024".into(),
            vmm_pid: Some(4242),
            api_socket: "/run/vmpod/s1/api.sock".into(),
            containers: vec![ContainerStateBlob {
                container_id: "c1".into(),
                state: ContainerState::Running,
                host_pid: Some(4243),
                devices: vec!["blk-1234".into()],
            }],
        }
    }

    #[tokio::test]
    async fn disk_save_load_round_trips_public_state() {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = DiskPersistence::new(StoreLayout::new(tmp.path()));

        let blob = sample_blob();
        persistence
            .save("s1", &blob.to_bytes().unwrap())
            .await
            .unwrap();

        let loaded = SandboxStateBlob::from_bytes(&persistence.load("s1").await.unwrap()).unwrap();
        assert_eq!(loaded, blob);
    }

    #[tokio::test]
    async fn disk_load_of_unknown_sandbox_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = DiskPersistence::new(StoreLayout::new(tmp.path()));
        let err = persistence.load("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn disk_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = DiskPersistence::new(StoreLayout::new(tmp.path()));
        persistence.save("s1", b"{}").await.unwrap();
        persistence.remove("s1").await.unwrap();
        persistence.remove("s1").await.unwrap();
    }
}
