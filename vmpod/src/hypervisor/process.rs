//! VMM child-process supervision.
//!
//! The VMM runs as a child of the supervisor. Its stdout/stderr are drained
//! line by line: lines carrying the VMM's own `*:INFO:*` / `*:WARN:*`
//! markers re-emit at the matching level, everything else at error. The
//! child is reaped on stop and its exit status surfaced to the logs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use vmpod_shared::{VmpodError, VmpodResult};

/// Poll step while waiting for the VMM process to exit.
const WAIT_POLL_STEP: Duration = Duration::from_millis(50);

/// A spawned VMM process with its log pump tasks.
pub struct VmmProcess {
    child: Child,
    pid: u32,
    name: String,
}

impl VmmProcess {
    /// Spawn `bin` with `args`, wiring the log pump.
    pub fn spawn(name: &str, bin: &PathBuf, args: &[String]) -> VmpodResult<Self> {
        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VmpodError::VmStartFailed(format!("failed to spawn {}: {}", bin.display(), e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| VmpodError::VmStartFailed("spawned VMM has no pid".into()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(name.to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(name.to_string(), "stderr", stderr));
        }

        tracing::info!(vmm = name, pid, "spawned VMM process");
        Ok(Self {
            child,
            pid,
            name: name.to_string(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while signal 0 still reaches the process.
    pub fn is_alive(&self) -> bool {
        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// Wait for the process to exit, polling with signal 0 up to `timeout`.
    pub async fn wait_exited(&mut self, timeout: Duration) -> VmpodResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                tracing::info!(vmm = %self.name, pid = self.pid, %status, "VMM exited");
                return Ok(());
            }
            if !self.is_alive() {
                self.reap().await;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmpodError::Timeout(format!(
                    "VMM pid {} did not exit within {:?}",
                    self.pid, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_STEP).await;
        }
    }

    /// Send a signal to the process; missing process is not an error.
    pub fn signal(&self, signal: Signal) -> VmpodResult<()> {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(VmpodError::Internal(format!(
                "signal {} to pid {} failed: {}",
                signal, self.pid, e
            ))),
        }
    }

    /// SIGKILL and reap.
    pub async fn kill(&mut self) -> VmpodResult<()> {
        self.signal(Signal::SIGKILL)?;
        self.reap().await;
        Ok(())
    }

    /// Join the child and log its exit code.
    pub async fn reap(&mut self) {
        match self.child.wait().await {
            Ok(status) => {
                tracing::info!(vmm = %self.name, pid = self.pid, %status, "reaped VMM process");
            }
            Err(e) => {
                tracing::warn!(vmm = %self.name, pid = self.pid, error = %e, "failed to reap VMM");
            }
        }
    }
}

/// Re-emit VMM output at a level inferred from the line itself.
async fn pump_lines(
    name: String,
    stream: &'static str,
    source: impl tokio::io::AsyncRead + Unpin,
) {
    let mut lines = BufReader::new(source).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains(":INFO:") {
            tracing::info!(vmm = %name, stream, "{}", line);
        } else if line.contains(":WARN:") {
            tracing::warn!(vmm = %name, stream, "{}", line);
        } else {
            tracing::error!(vmm = %name, stream, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_wait_short_lived_process() {
        let mut p = VmmProcess::spawn("test", &PathBuf::from("/bin/true"), &[]).unwrap();
        p.wait_exited(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let mut p = VmmProcess::spawn(
            "test",
            &PathBuf::from("/bin/sleep"),
            &["30".to_string()],
        )
        .unwrap();
        assert!(p.is_alive());
        p.kill().await.unwrap();
        p.wait_exited(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_while_process_runs() {
        let mut p = VmmProcess::spawn(
            "test",
            &PathBuf::from("/bin/sleep"),
            &["30".to_string()],
        )
        .unwrap();
        let err = p.wait_exited(Duration::from_millis(150)).await.unwrap_err();
        assert_eq!(err.kind(), "Timeout");
        p.kill().await.unwrap();
    }

    #[tokio::test]
    async fn signal_to_exited_process_is_ok() {
        let mut p = VmmProcess::spawn("test", &PathBuf::from("/bin/true"), &[]).unwrap();
        p.wait_exited(Duration::from_secs(5)).await.unwrap();
        assert!(p.signal(Signal::SIGTERM).is_ok());
    }
}
