//! Socket-backed agent client.
//!
//! Frames are `[len: u32 BE][id: u32 BE]` headers followed by a JSON body.
//! Request ids let a timed-out call leave the stream usable: the stale
//! response is discarded by id on the next exchange. Establishment is lazy;
//! a terminal transport failure latches the dead flag and the client
//! refuses every further attempt.

use std::os::fd::FromRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};
use tokio::sync::Mutex;

use vmpod_shared::{Transport, VmpodError, VmpodResult};

use crate::agent::types::*;
use crate::agent::AgentClient;
use crate::config::{AgentConfig, ContainerResources};

/// Frame bodies above this size are rejected as corrupt.
const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn write_frame(&mut self, id: u32, body: &[u8]) -> std::io::Result<()> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&(body.len() as u32).to_be_bytes());
        header[4..].copy_from_slice(&id.to_be_bytes());
        self.writer.write_all(&header).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await
    }

    async fn read_frame(&mut self) -> std::io::Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header[..4].try_into().expect("4 bytes"));
        let id = u32::from_be_bytes(header[4..].try_into().expect("4 bytes"));
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await?;
        Ok((id, body))
    }
}

/// Dial the configured transport and return a connected stream.
async fn dial(transport: &Transport) -> VmpodResult<UnixStream> {
    match transport {
        Transport::HybridVSock { uds, port } => dial_hybrid(uds, *port).await,
        Transport::VSock { cid, port } => dial_vsock(*cid, *port).await,
        Transport::RemoteSock { url } => {
            let path = url.strip_prefix("unix://").ok_or_else(|| {
                VmpodError::AgentUnreachable(format!("unsupported remote url {}", url))
            })?;
            UnixStream::connect(path)
                .await
                .map_err(|e| VmpodError::AgentUnreachable(format!("dial {}: {}", url, e)))
        }
        Transport::Mock => Err(VmpodError::AgentUnreachable(
            "mock transport is never dialed".into(),
        )),
    }
}

/// Hybrid vsock: connect to the bridge socket, then ask it to forward to
/// the guest port with the `CONNECT` handshake.
async fn dial_hybrid(uds: &Path, port: u32) -> VmpodResult<UnixStream> {
    let mut stream = UnixStream::connect(uds)
        .await
        .map_err(|e| VmpodError::AgentUnreachable(format!("dial {}: {}", uds.display(), e)))?;

    stream
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .await
        .map_err(|e| VmpodError::AgentUnreachable(format!("hybrid handshake write: {}", e)))?;

    // The bridge answers `OK <assigned>\n` on success.
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|e| VmpodError::AgentUnreachable(format!("hybrid handshake read: {}", e)))?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 64 {
            return Err(VmpodError::AgentUnreachable(
                "hybrid handshake reply too long".into(),
            ));
        }
    }
    let reply = String::from_utf8_lossy(&line);
    if !reply.starts_with("OK ") {
        return Err(VmpodError::AgentUnreachable(format!(
            "hybrid handshake refused: {}",
            reply
        )));
    }
    Ok(stream)
}

/// Native AF_VSOCK dial. The raw fd is wrapped as a unix stream; both are
/// SOCK_STREAM and tokio only needs the fd to be pollable.
async fn dial_vsock(cid: u32, port: u32) -> VmpodResult<UnixStream> {
    let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::os::unix::net::UnixStream> {
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = cid;
        addr.svm_port = port;

        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) })
    })
    .await
    .map_err(|e| VmpodError::Internal(format!("vsock dial task: {}", e)))?
    .map_err(|e| VmpodError::AgentUnreachable(format!("vsock {}:{}: {}", cid, port, e)))?;

    std_stream
        .set_nonblocking(true)
        .map_err(|e| VmpodError::AgentUnreachable(format!("vsock nonblocking: {}", e)))?;
    UnixStream::from_std(std_stream)
        .map_err(|e| VmpodError::AgentUnreachable(format!("vsock register: {}", e)))
}

/// Concrete agent client over a vsock-style socket.
pub struct SockAgentClient {
    transport: Transport,
    config: AgentConfig,
    conn: Mutex<Option<Conn>>,
    dead: AtomicBool,
    next_id: AtomicU32,
}

impl SockAgentClient {
    pub fn new(transport: Transport, config: AgentConfig) -> Self {
        Self {
            transport,
            config,
            conn: Mutex::new(None),
            dead: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Whether the dead flag has latched.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn latch_dead(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            tracing::error!(transport = %self.transport, "agent transport failed, latching dead flag");
        }
    }

    /// Send one request and wait for its response under the request-kind
    /// timeout. A timeout leaves the connection usable; a transport error
    /// latches the dead flag.
    async fn send(&self, request: AgentRequest) -> VmpodResult<AgentResponse> {
        if self.is_dead() {
            return Err(VmpodError::AgentDead);
        }

        let timeout = request.timeout(&self.config);
        let type_name = request.type_name();
        let body = serde_json::to_vec(&request)?;

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let dial_timeout = Duration::from_secs(self.config.dial_timeout_secs);
            let stream = match tokio::time::timeout(dial_timeout, dial(&self.transport)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.latch_dead();
                    return Err(e);
                }
                Err(_) => {
                    self.latch_dead();
                    return Err(VmpodError::AgentUnreachable(format!(
                        "dial timed out after {:?}",
                        dial_timeout
                    )));
                }
            };
            tracing::debug!(transport = %self.transport, "agent connection established");
            *guard = Some(Conn::new(stream));
        }
        let conn = guard.as_mut().expect("connected above");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let exchange = async {
            conn.write_frame(id, &body).await?;
            loop {
                let (frame_id, frame) = conn.read_frame().await?;
                if frame_id == id {
                    return Ok::<Vec<u8>, std::io::Error>(frame);
                }
                // Response to an earlier call that timed out; drop it.
                tracing::debug!(frame_id, expected = id, "discarding stale agent frame");
            }
        };

        let raw = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    // DeadlineExceeded is not a transport error; the
                    // connection stays usable for the next request.
                    return Err(VmpodError::Timeout(format!(
                        "{} exceeded {:?}",
                        type_name, limit
                    )));
                }
            },
            None => exchange.await,
        };

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                *guard = None;
                self.latch_dead();
                return Err(VmpodError::AgentUnreachable(format!(
                    "{} transport error: {}",
                    type_name, e
                )));
            }
        };

        let response: AgentResponse = serde_json::from_slice(&raw)?;
        if let AgentResponse::Error { message } = &response {
            return Err(map_agent_error(type_name, message));
        }
        Ok(response)
    }
}

/// Map an agent-reported error string onto the runtime error kinds.
fn map_agent_error(type_name: &str, message: &str) -> VmpodError {
    if message.contains("unknown request") || message.contains("unhandled request") {
        VmpodError::InvalidRequest(format!("{}: {}", type_name, message))
    } else if message.contains("not found") {
        VmpodError::NotFound(format!("{}: {}", type_name, message))
    } else {
        VmpodError::Internal(format!("{} failed in guest: {}", type_name, message))
    }
}

fn expect_ok(response: AgentResponse, type_name: &str) -> VmpodResult<()> {
    match response {
        AgentResponse::Ok => Ok(()),
        other => Err(VmpodError::InvalidRequest(format!(
            "{}: unexpected response {:?}",
            type_name, other
        ))),
    }
}

#[async_trait]
impl AgentClient for SockAgentClient {
    async fn create_sandbox(&self, req: CreateSandboxRequest) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::CreateSandbox(req)).await?,
            "CreateSandbox",
        )
    }

    async fn destroy_sandbox(&self) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::DestroySandbox).await?,
            "DestroySandbox",
        )
    }

    async fn create_container(&self, req: CreateContainerRequest) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::CreateContainer(req)).await?,
            "CreateContainer",
        )
    }

    async fn start_container(&self, container_id: &str) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::StartContainer {
                container_id: container_id.to_string(),
            })
            .await?,
            "StartContainer",
        )
    }

    async fn remove_container(&self, container_id: &str) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::RemoveContainer {
                container_id: container_id.to_string(),
            })
            .await?,
            "RemoveContainer",
        )
    }

    async fn exec_process(&self, req: ExecProcessRequest) -> VmpodResult<()> {
        expect_ok(self.send(AgentRequest::ExecProcess(req)).await?, "ExecProcess")
    }

    async fn signal_process(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: u32,
        all: bool,
    ) -> VmpodResult<()> {
        let result = self
            .send(AgentRequest::SignalProcess {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                signal,
                all,
            })
            .await;

        match result {
            Ok(response) => expect_ok(response, "SignalProcess"),
            // The process already exited; signalling it is a success.
            Err(VmpodError::Internal(message))
                if message.contains("ESRCH") || message.contains("No such process") =>
            {
                tracing::debug!(container_id, exec_id, "signal target already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_process(&self, container_id: &str, exec_id: &str) -> VmpodResult<i32> {
        match self
            .send(AgentRequest::WaitProcess {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            })
            .await?
        {
            AgentResponse::WaitProcess { status } => Ok(status),
            other => Err(VmpodError::InvalidRequest(format!(
                "WaitProcess: unexpected response {:?}",
                other
            ))),
        }
    }

    async fn pause_container(&self, container_id: &str) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::PauseContainer {
                container_id: container_id.to_string(),
            })
            .await?,
            "PauseContainer",
        )
    }

    async fn resume_container(&self, container_id: &str) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::ResumeContainer {
                container_id: container_id.to_string(),
            })
            .await?,
            "ResumeContainer",
        )
    }

    async fn stats_container(&self, container_id: &str) -> VmpodResult<ContainerStats> {
        match self
            .send(AgentRequest::StatsContainer {
                container_id: container_id.to_string(),
            })
            .await?
        {
            AgentResponse::Stats(stats) => Ok(stats),
            other => Err(VmpodError::InvalidRequest(format!(
                "StatsContainer: unexpected response {:?}",
                other
            ))),
        }
    }

    async fn update_container(
        &self,
        container_id: &str,
        resources: ContainerResources,
    ) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::UpdateContainer {
                container_id: container_id.to_string(),
                resources,
            })
            .await?,
            "UpdateContainer",
        )
    }

    async fn online_cpu_mem(&self, req: OnlineCpuMemRequest) -> VmpodResult<()> {
        expect_ok(
            self.send(AgentRequest::OnlineCpuMem(req)).await?,
            "OnlineCpuMem",
        )
    }

    async fn check(&self) -> VmpodResult<()> {
        expect_ok(self.send(AgentRequest::Check).await?, "Check")
    }

    async fn get_oom_event(&self) -> VmpodResult<String> {
        match self.send(AgentRequest::GetOomEvent).await? {
            AgentResponse::OomEvent { container_id } => Ok(container_id),
            other => Err(VmpodError::InvalidRequest(format!(
                "GetOomEvent: unexpected response {:?}",
                other
            ))),
        }
    }

    async fn copy_file(&self, req: CopyFileRequest) -> VmpodResult<()> {
        expect_ok(self.send(AgentRequest::CopyFile(req)).await?, "CopyFile")
    }

    async fn read_stdout(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>> {
        match self
            .send(AgentRequest::ReadStdout {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            })
            .await?
        {
            AgentResponse::Data { data } => Ok(data),
            other => Err(VmpodError::InvalidRequest(format!(
                "ReadStdout: unexpected response {:?}",
                other
            ))),
        }
    }

    async fn read_stderr(&self, container_id: &str, exec_id: &str) -> VmpodResult<Vec<u8>> {
        match self
            .send(AgentRequest::ReadStderr {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            })
            .await?
        {
            AgentResponse::Data { data } => Ok(data),
            other => Err(VmpodError::InvalidRequest(format!(
                "ReadStderr: unexpected response {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// In-process agent answering over the frame codec.
    async fn serve_one(listener: UnixListener, reply: fn(AgentRequest) -> AgentResponse) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Conn::new(stream);
        loop {
            let Ok((id, body)) = conn.read_frame().await else {
                return;
            };
            let request: AgentRequest = serde_json::from_slice(&body).unwrap();
            let response = serde_json::to_vec(&reply(request)).unwrap();
            conn.write_frame(id, &response).await.unwrap();
        }
    }

    fn client_for(path: &Path, config: AgentConfig) -> SockAgentClient {
        SockAgentClient::new(
            Transport::RemoteSock {
                url: format!("unix://{}", path.display()),
            },
            config,
        )
    }

    #[tokio::test]
    async fn check_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_one(listener, |_| AgentResponse::Ok));

        let client = client_for(&path, AgentConfig::default());
        client.check().await.unwrap();
        assert!(!client.is_dead());
    }

    #[tokio::test]
    async fn dial_failure_latches_dead_flag() {
        let client = client_for(Path::new("/nonexistent/agent.sock"), AgentConfig::default());

        let err = client.check().await.unwrap_err();
        assert_eq!(err.kind(), "AgentUnreachable");
        assert!(client.is_dead());

        // Latched: the client refuses further attempts.
        let err = client.check().await.unwrap_err();
        assert_eq!(err.kind(), "AgentDead");
    }

    #[tokio::test]
    async fn slow_response_is_timeout_and_connection_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // Answer WaitProcess-class requests instantly, stall Check once.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Conn::new(stream);
            let mut stalled = false;
            loop {
                let Ok((id, body)) = conn.read_frame().await else {
                    return;
                };
                let request: AgentRequest = serde_json::from_slice(&body).unwrap();
                if matches!(request, AgentRequest::Check) && !stalled {
                    stalled = true;
                    // Never answer frame `id`; the client times out.
                    continue;
                }
                let response = serde_json::to_vec(&AgentResponse::Ok).unwrap();
                conn.write_frame(id, &response).await.unwrap();
            }
        });

        let config = AgentConfig {
            check_timeout_secs: 1,
            ..Default::default()
        };
        let client = client_for(&path, config);

        let err = client.check().await.unwrap_err();
        assert_eq!(err.kind(), "Timeout");
        assert!(!client.is_dead());

        // The same connection serves the next request.
        client.check().await.unwrap();
    }

    #[tokio::test]
    async fn esrch_from_signal_process_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_one(listener, |req| match req {
            AgentRequest::SignalProcess { .. } => AgentResponse::Error {
                message: "ESRCH No such process".into(),
            },
            _ => AgentResponse::Ok,
        }));

        let client = client_for(&path, AgentConfig::default());
        client.signal_process("c1", "e1", 15, false).await.unwrap();
    }
}
