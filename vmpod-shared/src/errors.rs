//! Error types used across the vmpod runtime.

use thiserror::Error;

/// Result type for vmpod operations.
pub type VmpodResult<T> = Result<T, VmpodError>;

/// Structured runtime error: one kind, a message, and an optional cause.
#[derive(Debug, Error)]
pub enum VmpodError {
    #[error("invalid annotation: {0}")]
    AnnotationInvalid(String),

    #[error("annotation path not in allow-list: {0}")]
    AnnotationNotAllowed(String),

    #[error("asset missing: {0}")]
    AssetMissing(String),

    #[error("asset digest mismatch for {path}: expected {expected}, got {actual}")]
    AssetHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid device: {0}")]
    DeviceInvalid(String),

    #[error("device attach failed: {0}")]
    DeviceAttachFailed(String),

    #[error("device not attached: {0}")]
    DeviceNotAttached(String),

    #[error("device does not exist: {0}")]
    DeviceNotExist(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("shared-fs daemon failed: {0}")]
    SharedFsDaemonFailed(String),

    #[error("vm start failed: {0}")]
    VmStartFailed(String),

    #[error("vm in inconsistent state: {0}")]
    VmStartInconsistent(String),

    #[error("unexpected PCI address: {0}")]
    UnexpectedPciAddress(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("agent connection is dead")]
    AgentDead,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid state transition: {0}")]
    StateTransitionInvalid(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmpodError {
    /// Stable kind name, for callers that map errors to exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            VmpodError::AnnotationInvalid(_) => "AnnotationInvalid",
            VmpodError::AnnotationNotAllowed(_) => "AnnotationNotAllowed",
            VmpodError::AssetMissing(_) => "AssetMissing",
            VmpodError::AssetHashMismatch { .. } => "AssetHashMismatch",
            VmpodError::ConfigInvalid(_) => "ConfigInvalid",
            VmpodError::DeviceInvalid(_) => "DeviceInvalid",
            VmpodError::DeviceAttachFailed(_) => "DeviceAttachFailed",
            VmpodError::DeviceNotAttached(_) => "DeviceNotAttached",
            VmpodError::DeviceNotExist(_) => "DeviceNotExist",
            VmpodError::MountFailed(_) => "MountFailed",
            VmpodError::SharedFsDaemonFailed(_) => "SharedFsDaemonFailed",
            VmpodError::VmStartFailed(_) => "VmStartFailed",
            VmpodError::VmStartInconsistent(_) => "VmStartInconsistent",
            VmpodError::UnexpectedPciAddress(_) => "UnexpectedPciAddress",
            VmpodError::InvalidRequest(_) => "InvalidRequest",
            VmpodError::AgentUnreachable(_) => "AgentUnreachable",
            VmpodError::AgentDead => "AgentDead",
            VmpodError::Timeout(_) => "Timeout",
            VmpodError::NotSupported(_) => "NotSupported",
            VmpodError::StateTransitionInvalid(_) => "StateTransitionInvalid",
            VmpodError::AlreadyExists(_) => "AlreadyExists",
            VmpodError::NotFound(_) => "NotFound",
            VmpodError::Internal(_) => "Internal",
        }
    }

    /// True for errors that indicate the agent transport itself is gone.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, VmpodError::AgentUnreachable(_) | VmpodError::AgentDead)
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for VmpodError {
    fn from(err: std::io::Error) -> Self {
        VmpodError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for VmpodError {
    fn from(err: serde_json::Error) -> Self {
        VmpodError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for VmpodError {
    fn from(err: String) -> Self {
        VmpodError::Internal(err)
    }
}

impl From<&str> for VmpodError {
    fn from(err: &str) -> Self {
        VmpodError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(VmpodError::AgentDead.kind(), "AgentDead");
        assert_eq!(
            VmpodError::Timeout("CreateContainer".into()).kind(),
            "Timeout"
        );
        assert_eq!(
            VmpodError::AssetHashMismatch {
                path: "/k".into(),
                expected: "aa".into(),
                actual: "bb".into(),
            }
            .kind(),
            "AssetHashMismatch"
        );
    }

    #[test]
    fn transport_fatal_classification() {
        assert!(VmpodError::AgentDead.is_transport_fatal());
        assert!(VmpodError::AgentUnreachable("dial".into()).is_transport_fatal());
        // A timeout leaves the connection usable.
        assert!(!VmpodError::Timeout("Check".into()).is_transport_fatal());
    }
}
