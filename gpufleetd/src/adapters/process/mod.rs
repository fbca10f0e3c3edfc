// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Supervised OS child processes: spawn, exit check, graceful stop, force kill.
//!
//! On Unix every child leads its own process group and signals go to the
//! whole group. Wrappers such as `sshpass` run the real forwarder as a
//! grandchild, which must not outlive the tunnel.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::app::ports::{ExitReport, ManagedProcess, StopOutcome};

/// Bytes of stderr kept for exit diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// Timeout for the stderr reader to catch up after the child exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Bound on reaping a child after SIGKILL.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment; used to hand secrets to the child without argv.
    pub env: Vec<(String, String)>,
}

impl ProcessCommand {
    /// Loggable rendering; environment values are never included.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Debug, ThisError)]
pub enum ProcessError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Signals the process group led by `pid`. Returns false when no signal
/// could be delivered, including when the group is already gone.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    let Ok(pgid) = i32::try_from(pid) else {
        tracing::warn!(pid, "pid does not fit in i32, cannot signal its group");
        return false;
    };
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            tracing::warn!(pgid, "failed to send {signal} to process group: {err}");
            false
        }
    }
}

#[cfg(unix)]
fn terminate_group(pid: Option<u32>) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) -> bool {
    false
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

fn spawn_stderr_reader(stderr: ChildStderr, tail: Arc<StdMutex<String>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "gpufleetd::tunnel", "{line}");
            if let Ok(mut tail) = tail.lock() {
                push_tail(&mut tail, &line);
            }
        }
    })
}

/// One spawned child with its stderr captured into a bounded tail buffer.
pub struct SupervisedProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    stderr_tail: Arc<StdMutex<String>>,
    stderr_reader: Mutex<Option<JoinHandle<()>>>,
    exit: Mutex<Option<ExitReport>>,
}

impl SupervisedProcess {
    pub fn spawn(command: &ProcessCommand) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ProcessError::NotFound(command.program.clone()),
            _ => ProcessError::Spawn {
                program: command.program.clone(),
                source,
            },
        })?;

        let stderr_tail = Arc::new(StdMutex::new(String::new()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, stderr_tail.clone()));
        let pid = child.id();
        tracing::debug!(pid = ?pid, command = %command.display(), "spawned child process");
        Ok(Self {
            pid,
            child: Mutex::new(child),
            stderr_tail,
            stderr_reader: Mutex::new(stderr_reader),
            exit: Mutex::new(None),
        })
    }

    /// Stores the leader's exit and kills whatever is left of its group.
    async fn record_exit(&self, status: std::process::ExitStatus) -> ExitReport {
        if kill_group(self.pid) {
            tracing::debug!(pid = ?self.pid, "killed leftover processes in group");
        }
        if let Some(reader) = self.stderr_reader.lock().await.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await;
        }
        let stderr = self
            .stderr_tail
            .lock()
            .map(|tail| tail.clone())
            .unwrap_or_default();
        let report = ExitReport {
            code: status.code(),
            signal: exit_signal(&status),
            stderr,
        };
        *self.exit.lock().await = Some(report.clone());
        report
    }
}

#[async_trait]
impl ManagedProcess for SupervisedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn try_exit(&self) -> Option<ExitReport> {
        if let Some(report) = self.exit.lock().await.clone() {
            return Some(report);
        }
        let status = {
            let mut child = self.child.lock().await;
            match child.try_wait() {
                Ok(status) => status?,
                Err(err) => {
                    tracing::warn!(pid = ?self.pid, "failed to poll child process: {err}");
                    return None;
                }
            }
        };
        Some(self.record_exit(status).await)
    }

    async fn stop(&self, grace: Duration) -> StopOutcome {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            drop(child);
            self.record_exit(status).await;
            return StopOutcome::AlreadyExited;
        }

        let sent = terminate_group(self.pid);
        tracing::debug!(pid = ?self.pid, graceful = sent, "sent termination signal");
        if sent {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    drop(child);
                    self.record_exit(status).await;
                    return StopOutcome::Graceful;
                }
                Ok(Err(err)) => {
                    tracing::warn!(pid = ?self.pid, "failed to wait for process: {err}");
                }
                Err(_) => {
                    tracing::debug!(pid = ?self.pid, "grace period expired, force killing");
                }
            }
        }

        kill_group(self.pid);
        // the leader alone, for platforms without process groups
        if let Err(err) = child.start_kill() {
            tracing::debug!(pid = ?self.pid, "start_kill: {err}");
        }
        let waited = tokio::time::timeout(KILL_WAIT_TIMEOUT, child.wait()).await;
        drop(child);
        match waited {
            Ok(Ok(status)) => {
                self.record_exit(status).await;
                StopOutcome::Killed
            }
            Ok(Err(err)) => {
                tracing::warn!(pid = ?self.pid, "failed to force kill: {err}");
                StopOutcome::KillFailed(err.to_string())
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "process survived SIGKILL");
                StopOutcome::KillFailed("process did not exit after SIGKILL".to_string())
            }
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the leader; while it is unreaped the
        // group id cannot have been recycled.
        if self.exit.get_mut().is_none() {
            kill_group(self.pid);
        }
    }
}
