//! Wire types for the guest-agent channel.
//!
//! Requests are an exhaustive enum: every dispatch site matches on the
//! variant, and the per-kind timeout policy lives next to the type rather
//! than in a name-keyed table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, ContainerResources};

/// Storage driver names understood by the guest agent.
pub mod storage_driver {
    pub const VIRTIO_FS: &str = "virtio-fs";
    pub const VIRTIO_9P: &str = "virtio-9p";
    pub const BLK: &str = "blk";
    pub const MMIO_BLK: &str = "mmioblk";
    pub const SCSI: &str = "scsi";
    pub const NVDIMM: &str = "nvdimm";
    pub const EPHEMERAL: &str = "ephemeral";
    pub const LOCAL: &str = "local";
    pub const WATCHABLE_BIND: &str = "watchable-bind";
}

/// A filesystem the agent must mount before a workload starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub driver: String,
    pub driver_options: Vec<String>,
    pub source: String,
    pub fs_type: String,
    pub options: Vec<String>,
    pub mount_point: String,
}

/// A device the agent relinks into the container namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDevice {
    pub id: String,
    pub container_path: String,
    pub kind: String,
    pub vm_path: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub sandbox_id: String,
    pub hostname: String,
    pub dns: Vec<String>,
    pub storages: Vec<Storage>,
    pub sandbox_pidns: bool,
    pub kernel_modules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub container_id: String,
    pub exec_id: String,
    pub storages: Vec<Storage>,
    pub devices: Vec<AgentDevice>,
    /// Serialized, guest-constrained OCI spec.
    pub oci_spec: serde_json::Value,
    pub sandbox_pidns: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub container_id: String,
    pub exec_id: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnlineCpuMemRequest {
    /// Wait for the guest to finish onlining before returning.
    pub wait: bool,
    pub nb_cpus: u32,
    pub cpu_only: bool,
}

/// Maximum payload per `CopyFile` call.
pub const COPY_FILE_MAX_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyFileRequest {
    pub path: String,
    pub file_size: i64,
    pub offset: i64,
    pub mode: u32,
    #[serde(with = "serde_bytes_b64")]
    pub data: Vec<u8>,
    /// Set for symlinks: the link target, sent in a single call.
    pub symlink_target: Option<String>,
}

/// Base64 body encoding keeps copy payloads compact in JSON frames.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Container statistics reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_usage_usec: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids_current: u64,
}

/// Every request the runtime can send to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentRequest {
    CreateSandbox(CreateSandboxRequest),
    DestroySandbox,
    CreateContainer(CreateContainerRequest),
    StartContainer {
        container_id: String,
    },
    RemoveContainer {
        container_id: String,
    },
    ExecProcess(ExecProcessRequest),
    SignalProcess {
        container_id: String,
        exec_id: String,
        signal: u32,
        all: bool,
    },
    WaitProcess {
        container_id: String,
        exec_id: String,
    },
    PauseContainer {
        container_id: String,
    },
    ResumeContainer {
        container_id: String,
    },
    StatsContainer {
        container_id: String,
    },
    UpdateContainer {
        container_id: String,
        resources: ContainerResources,
    },
    OnlineCpuMem(OnlineCpuMemRequest),
    Check,
    GetOomEvent,
    CopyFile(CopyFileRequest),
    ReadStdout {
        container_id: String,
        exec_id: String,
    },
    ReadStderr {
        container_id: String,
        exec_id: String,
    },
}

impl AgentRequest {
    /// Stable request type name (logging and error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            AgentRequest::CreateSandbox(_) => "CreateSandbox",
            AgentRequest::DestroySandbox => "DestroySandbox",
            AgentRequest::CreateContainer(_) => "CreateContainer",
            AgentRequest::StartContainer { .. } => "StartContainer",
            AgentRequest::RemoveContainer { .. } => "RemoveContainer",
            AgentRequest::ExecProcess(_) => "ExecProcess",
            AgentRequest::SignalProcess { .. } => "SignalProcess",
            AgentRequest::WaitProcess { .. } => "WaitProcess",
            AgentRequest::PauseContainer { .. } => "PauseContainer",
            AgentRequest::ResumeContainer { .. } => "ResumeContainer",
            AgentRequest::StatsContainer { .. } => "StatsContainer",
            AgentRequest::UpdateContainer { .. } => "UpdateContainer",
            AgentRequest::OnlineCpuMem(_) => "OnlineCpuMem",
            AgentRequest::Check => "Check",
            AgentRequest::GetOomEvent => "GetOomEvent",
            AgentRequest::CopyFile(_) => "CopyFile",
            AgentRequest::ReadStdout { .. } => "ReadStdout",
            AgentRequest::ReadStderr { .. } => "ReadStderr",
        }
    }

    /// Timeout policy for this request kind. `None` means unbounded: the
    /// call ends only when it completes or the connection drops.
    pub fn timeout(&self, config: &AgentConfig) -> Option<Duration> {
        match self {
            AgentRequest::WaitProcess { .. } | AgentRequest::GetOomEvent => None,
            AgentRequest::Check => Some(Duration::from_secs(config.check_timeout_secs)),
            AgentRequest::CreateContainer(_) => {
                Some(Duration::from_secs(config.create_container_timeout_secs))
            }
            _ => Some(Duration::from_secs(config.request_timeout_secs)),
        }
    }
}

/// Every response the agent can send back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentResponse {
    Ok,
    WaitProcess {
        status: i32,
    },
    Stats(ContainerStats),
    OomEvent {
        container_id: String,
    },
    Data {
        #[serde(with = "serde_bytes_b64")]
        data: Vec<u8>,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_policy_matches_request_kind() {
        let cfg = AgentConfig::default();

        assert!(AgentRequest::WaitProcess {
            container_id: "c1".into(),
            exec_id: "c1".into(),
        }
        .timeout(&cfg)
        .is_none());
        assert!(AgentRequest::GetOomEvent.timeout(&cfg).is_none());

        assert_eq!(
            AgentRequest::Check.timeout(&cfg),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            AgentRequest::CreateContainer(CreateContainerRequest::default()).timeout(&cfg),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            AgentRequest::DestroySandbox.timeout(&cfg),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn requests_round_trip_through_json() {
        let req = AgentRequest::SignalProcess {
            container_id: "c1".into(),
            exec_id: "e1".into(),
            signal: 15,
            all: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"SignalProcess\""));
        let back: AgentRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_name(), "SignalProcess");
    }

    #[test]
    fn copy_file_payload_is_base64_in_json() {
        let req = CopyFileRequest {
            path: "/etc/resolv.conf".into(),
            file_size: 3,
            offset: 0,
            mode: 0o644,
            data: vec![1, 2, 3],
            symlink_target: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("AQID"));
        let back: CopyFileRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![1, 2, 3]);
    }
}
