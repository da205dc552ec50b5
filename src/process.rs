//! Ownership of the gateway's OS process
//!
//! A [`ProcessHandle`] owns exactly one child. A background task waits on the
//! child and publishes its exit on a watch channel, so exit can be observed
//! by any number of parties without anyone holding the `Child` itself.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the gateway process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={}", code),
            (None, Some(signal)) => write!(f, "signal={}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Cloneable view of a process's exit
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitWatch {
    /// The exit, if it already happened
    pub fn get(&self) -> Option<ExitInfo> {
        *self.rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.get().is_some()
    }

    /// Wait until the process exits
    pub async fn wait(mut self) -> ExitInfo {
        let info = match self.rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or_default(),
            // Waiter task is gone (runtime shutting down); nothing left to observe
            Err(_) => ExitInfo::default(),
        };
        info
    }
}

/// Handle to the running gateway process
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: ExitWatch,
    #[cfg(not(unix))]
    kill: std::sync::Arc<tokio::sync::Notify>,
}

impl ProcessHandle {
    /// Take ownership of a spawned child. Must be called inside a tokio runtime.
    pub fn from_child(mut child: Child) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);

        #[cfg(not(unix))]
        let kill = std::sync::Arc::new(tokio::sync::Notify::new());
        #[cfg(not(unix))]
        let kill_requested = std::sync::Arc::clone(&kill);

        tokio::spawn(async move {
            #[cfg(unix)]
            let status = child.wait().await;
            #[cfg(not(unix))]
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for gateway process");
                    ExitInfo::default()
                }
            };
            debug!(pid, %info, "Gateway process reaped");
            let _ = exit_tx.send(Some(info));
        });

        Self {
            pid,
            exit: ExitWatch { rx: exit_rx },
            #[cfg(not(unix))]
            kill,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    /// Ask the process to terminate (SIGTERM on Unix). Does not wait.
    pub fn terminate(&self) {
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            info!(pid, "Sending SIGTERM to gateway");
            // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            info!(pid = self.pid, "Killing gateway");
            self.kill.notify_one();
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &self.exit.get())
            .finish()
    }
}

/// Everything needed to start the gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

/// Creates gateway processes
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, launch: &LaunchSpec) -> std::io::Result<ProcessHandle>;
}

/// Spawns the gateway as a local child process
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> std::io::Result<ProcessHandle> {
        info!(program = %launch.program, "Starting gateway process");

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref dir) = launch.current_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        info!(pid = child.id().unwrap_or(0), "Gateway process spawned");

        Ok(ProcessHandle::from_child(child))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn launch(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let handle = CommandSpawner.spawn(&launch("sleep", &["30"])).unwrap();
        assert!(handle.pid().is_some());
        assert!(!handle.has_exited());

        handle.terminate();

        let info = tokio::time::timeout(Duration::from_secs(5), handle.exit_watch().wait())
            .await
            .expect("process should exit after SIGTERM");
        assert_eq!(info.signal, Some(libc::SIGTERM));
        assert_eq!(info.code, None);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_exit_code_observed() {
        let handle = CommandSpawner.spawn(&launch("sh", &["-c", "exit 3"])).unwrap();

        let info = tokio::time::timeout(Duration::from_secs(5), handle.exit_watch().wait())
            .await
            .unwrap();
        assert_eq!(info.code, Some(3));
        assert_eq!(info.to_string(), "code=3");
    }

    #[tokio::test]
    async fn test_multiple_exit_watchers() {
        let handle = CommandSpawner.spawn(&launch("sleep", &["0.1"])).unwrap();
        let a = handle.exit_watch();
        let b = handle.exit_watch();

        let (a, b) = tokio::join!(a.wait(), b.wait());
        assert_eq!(a, b);
        assert_eq!(a.code, Some(0));
    }

    #[tokio::test]
    async fn test_env_passed_to_child() {
        let mut spec = launch("sh", &["-c", "test \"$WAKEGATE_PROBE\" = yes"]);
        spec.env.push(("WAKEGATE_PROBE".to_string(), "yes".to_string()));
        let handle = CommandSpawner.spawn(&spec).unwrap();

        let info = handle.exit_watch().wait().await;
        assert_eq!(info.code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let result = CommandSpawner.spawn(&launch("/nonexistent/wakegate-gateway", &[]));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let handle = CommandSpawner.spawn(&launch("true", &[])).unwrap();
        handle.exit_watch().wait().await;

        // Must not signal a possibly recycled pid
        handle.terminate();
        assert!(handle.has_exited());
    }

    #[test]
    fn test_exit_info_display() {
        let signalled = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signalled.to_string(), "signal=9");
        assert_eq!(ExitInfo::default().to_string(), "unknown status");
    }
}
