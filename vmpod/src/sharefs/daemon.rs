//! Shared-FS daemon lifecycle.
//!
//! The daemon exports the sandbox's `shared/` tree into the guest. It is
//! started before the VMM boots; if it exits before the sandbox stops,
//! the sandbox observes that through the exit channel and tears the VM
//! down.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;

use vmpod_shared::{VmpodError, VmpodResult};

use crate::config::HypervisorConfig;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running shared-FS daemon process.
#[derive(Debug)]
pub struct VirtiofsDaemon {
    pid: u32,
    socket: PathBuf,
    exit_rx: watch::Receiver<bool>,
    waiter: Option<tokio::task::JoinHandle<()>>,
}

impl VirtiofsDaemon {
    /// Spawn the daemon exporting `shared_dir` on `socket`.
    pub fn start(
        hv: &HypervisorConfig,
        shared_dir: &PathBuf,
        socket: &PathBuf,
    ) -> VmpodResult<Self> {
        let mut args: Vec<String> = vec![
            "--socket-path".into(),
            socket.display().to_string(),
            "--shared-dir".into(),
            shared_dir.display().to_string(),
            "--cache".into(),
            hv.virtio_fs_cache.clone(),
        ];
        args.extend(hv.virtio_fs_extra_args.iter().cloned());

        let mut child = Command::new(&hv.virtio_fs_daemon)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                VmpodError::SharedFsDaemonFailed(format!(
                    "failed to spawn {}: {}",
                    hv.virtio_fs_daemon.display(),
                    e
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| VmpodError::SharedFsDaemonFailed("daemon has no pid".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(daemon = "virtiofsd", "{}", line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(daemon = "virtiofsd", pid, %status, "shared-fs daemon exited")
                }
                Err(e) => {
                    tracing::warn!(daemon = "virtiofsd", pid, error = %e, "failed to reap daemon")
                }
            }
            let _ = exit_tx.send(true);
        });

        tracing::info!(daemon = "virtiofsd", pid, socket = %socket.display(), "started shared-fs daemon");
        Ok(Self {
            pid,
            socket: socket.clone(),
            exit_rx,
            waiter: Some(waiter),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket(&self) -> &PathBuf {
        &self.socket
    }

    /// Channel that flips to `true` when the daemon exits.
    pub fn exit_channel(&self) -> watch::Receiver<bool> {
        self.exit_rx.clone()
    }

    /// True once the daemon has exited.
    pub fn has_exited(&self) -> bool {
        *self.exit_rx.borrow()
    }

    /// Terminate the daemon: SIGTERM, then SIGKILL after a grace period.
    pub async fn stop(&mut self) {
        if self.has_exited() {
            return;
        }
        let pid = Pid::from_raw(self.pid as i32);
        let _ = kill(pid, Signal::SIGTERM);

        let mut exit_rx = self.exit_rx.clone();
        let exited = tokio::time::timeout(STOP_TIMEOUT, async {
            while !*exit_rx.borrow() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            tracing::warn!(pid = self.pid, "shared-fs daemon ignored SIGTERM, killing");
            let _ = kill(pid, Signal::SIGKILL);
        }

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_config(bin: &str) -> HypervisorConfig {
        HypervisorConfig {
            virtio_fs_daemon: PathBuf::from(bin),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_daemon_binary_is_shared_fs_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = VirtiofsDaemon::start(
            &daemon_config("/definitely/not/virtiofsd"),
            &dir.path().join("shared"),
            &dir.path().join("virtiofsd.sock"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "SharedFsDaemonFailed");
    }

    #[tokio::test]
    async fn exit_channel_observes_daemon_death() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/true exits immediately; the channel must flip.
        let daemon = VirtiofsDaemon::start(
            &daemon_config("/bin/true"),
            &dir.path().join("shared"),
            &dir.path().join("virtiofsd.sock"),
        )
        .unwrap();

        let mut rx = daemon.exit_channel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*rx.borrow() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(daemon.has_exited());
    }

    #[tokio::test]
    async fn stop_after_exit_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = VirtiofsDaemon::start(
            &daemon_config("/bin/true"),
            &dir.path().join("shared"),
            &dir.path().join("sock"),
        )
        .unwrap();

        let mut rx = daemon.exit_channel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*rx.borrow() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        daemon.stop().await;
        assert!(daemon.has_exited());
    }
}
