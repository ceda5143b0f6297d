//! Guest-agent RPC client.
//!
//! The wire protocol belongs to the agent; the runtime contracts at the
//! [`AgentClient`] trait. The concrete client dials a vsock-style socket
//! lazily, applies the per-request timeout policy, and latches a dead flag
//! on terminal transport failure.

pub mod mock;
pub mod sock;
pub mod types;

pub use mock::MockAgent;
pub use sock::SockAgentClient;
pub use types::*;

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;

use vmpod_shared::{VmpodError, VmpodResult};

/// Host-side contract for talking to the in-guest agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_sandbox(&self, req: CreateSandboxRequest) -> VmpodResult<()>;
    async fn destroy_sandbox(&self) -> VmpodResult<()>;

    async fn create_container(&self, req: CreateContainerRequest) -> VmpodResult<()>;
    async fn start_container(&self, container_id: &str) -> VmpodResult<()>;
    async fn remove_container(&self, container_id: &str) -> VmpodResult<()>;

    async fn exec_process(&self, req: ExecProcessRequest) -> VmpodResult<()>;
    async fn signal_process(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: u32,
        all: bool,
    ) -> VmpodResult<()>;
    async fn wait_process(&self, container_id: &str, exec_id: &str) -> VmpodResult<i32>;

    async fn pause_container(&self, container_id: &str) -> VmpodResult<()>;
    async fn resume_container(&self, container_id: &str) -> VmpodResult<()>;
    async fn stats_container(&self, container_id: &str) -> VmpodResult<ContainerStats>;
    async fn update_container(
        &self,
        container_id: &str,
        resources: crate::config::ContainerResources,
    ) -> VmpodResult<()>;

    async fn online_cpu_mem(&self, req: OnlineCpuMemRequest) -> VmpodResult<()>;
    async fn check(&self) -> VmpodResult<()>;
    async fn get_oom_event(&self) -> VmpodResult<String>;
    async fn copy_file(&self, req: CopyFileRequest) -> VmpodResult<()>;

    async fn read_stdout(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>>;
    async fn read_stderr(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>>;
}

/// Copy a host file into the guest in bounded chunks.
///
/// Symlinks are one call carrying the link target; empty regular files are
/// one zero-length call; everything else streams 1 MiB chunks with offset
/// and total-size bookkeeping.
pub async fn copy_host_file(
    client: &dyn AgentClient,
    host_path: &Path,
    guest_path: &str,
) -> VmpodResult<()> {
    let meta = std::fs::symlink_metadata(host_path).map_err(|e| {
        VmpodError::NotFound(format!("copy source {}: {}", host_path.display(), e))
    })?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(host_path)?;
        return client
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size: 0,
                offset: 0,
                mode: meta.mode(),
                data: Vec::new(),
                symlink_target: Some(target.display().to_string()),
            })
            .await;
    }

    let contents = std::fs::read(host_path)?;
    let total = contents.len() as i64;

    if contents.is_empty() {
        return client
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size: 0,
                offset: 0,
                mode: meta.mode(),
                data: Vec::new(),
                symlink_target: None,
            })
            .await;
    }

    let mut offset = 0usize;
    while offset < contents.len() {
        let end = (offset + COPY_FILE_MAX_CHUNK).min(contents.len());
        client
            .copy_file(CopyFileRequest {
                path: guest_path.to_string(),
                file_size: total,
                offset: offset as i64,
                mode: meta.mode(),
                data: contents[offset..end].to_vec(),
                symlink_target: None,
            })
            .await?;
        offset = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn copy_file_chunks_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; COPY_FILE_MAX_CHUNK + 10]).unwrap();

        let agent = MockAgent::new();
        copy_host_file(&agent, &path, "/guest/big").await.unwrap();

        let copies = agent.copied_files();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].offset, 0);
        assert_eq!(copies[0].data.len(), COPY_FILE_MAX_CHUNK);
        assert_eq!(copies[1].offset, COPY_FILE_MAX_CHUNK as i64);
        assert_eq!(copies[1].data.len(), 10);
        assert_eq!(copies[1].file_size, (COPY_FILE_MAX_CHUNK + 10) as i64);
    }

    #[tokio::test]
    async fn copy_file_empty_file_is_single_zero_size_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();

        let agent = MockAgent::new();
        copy_host_file(&agent, &path, "/guest/empty").await.unwrap();

        let copies = agent.copied_files();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].file_size, 0);
        assert!(copies[0].data.is_empty());
    }

    #[tokio::test]
    async fn copy_file_symlink_is_single_call_with_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let agent = MockAgent::new();
        copy_host_file(&agent, &link, "/guest/link").await.unwrap();

        let copies = agent.copied_files();
        assert_eq!(copies.len(), 1);
        assert_eq!(
            copies[0].symlink_target.as_deref(),
            Some(target.to_str().unwrap())
        );
    }
}
