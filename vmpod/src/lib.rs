//! vmpod runtime library.
//!
//! This crate is the host-side core of a hardware-isolated container
//! runtime: every pod ("sandbox") gets its own lightweight VM, and OCI
//! containers run inside it behind a guest agent reached over a
//! vsock-style socket.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod annotations;
pub mod assets;
pub mod cmdline;
pub mod config;
pub mod container;
pub mod device;
pub mod hypervisor;
pub mod layout;
pub mod mount;
pub mod persist;
pub mod resize;
pub mod runtime;
pub mod sandbox;
pub mod sharefs;

pub mod agent;
pub mod ocispec;

pub use runtime::VmpodRuntime;
pub use vmpod_shared::{Transport, VmpodError, VmpodResult};

pub use config::{ContainerConfig, HypervisorConfig, RuntimeOptions, SandboxConfig};
pub use container::ContainerState;
pub use sandbox::SandboxState;

use layout::StoreLayout;

/// Initialize tracing for vmpod using the provided store layout.
///
/// Logs are written to `<store>/logs/vmpod.log` with daily rotation and
/// filtered through `RUST_LOG` (default `info`). Idempotent: subsequent
/// calls return immediately once initialized. Embedders that install their
/// own subscriber can simply skip this.
pub fn init_logging_for(layout: &StoreLayout) -> VmpodResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        VmpodError::ConfigInvalid(format!(
            "failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(logs_dir, "vmpod.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // If a global default subscriber is already set this returns an
        // error; ignore it so we never fight the embedder's tracing setup.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .try_init();

        guard
    });

    Ok(())
}
