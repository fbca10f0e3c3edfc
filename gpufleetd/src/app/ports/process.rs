// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Host;

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Captured stderr, possibly truncated to the tail.
    pub stderr: String,
}

impl ExitReport {
    /// Human-readable reason, classifying the usual ssh failures.
    pub fn reason(&self) -> String {
        let stderr = self.stderr.trim();
        let lowered = stderr.to_ascii_lowercase();
        let last_line = stderr.lines().last().unwrap_or_default().trim();
        if lowered.contains("permission denied") || lowered.contains("authentication failed") {
            return format!("authentication failed: {last_line}");
        }
        if lowered.contains("connection refused") {
            return format!("connection refused: {last_line}");
        }
        if lowered.contains("address already in use") || lowered.contains("cannot listen to port")
        {
            return format!("local port unavailable: {last_line}");
        }
        if lowered.contains("could not resolve hostname") {
            return format!("host name lookup failed: {last_line}");
        }
        if let Some(signal) = self.signal {
            return format!("killed by signal {signal}");
        }
        match (self.code, last_line.is_empty()) {
            (Some(code), true) => format!("exited with code {code}"),
            (Some(code), false) => format!("exited with code {code}: {last_line}"),
            (None, true) => "exited".to_string(),
            (None, false) => format!("exited: {last_line}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace window after the termination signal.
    Graceful,
    /// Ignored the signal and was force-killed.
    Killed,
    AlreadyExited,
    /// Force kill failed; the message is kept as a warning.
    KillFailed(String),
}

/// A long-lived OS child process under supervision.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    async fn try_exit(&self) -> Option<ExitReport>;

    /// Graceful termination, bounded wait, then force kill.
    async fn stop(&self, grace: Duration) -> StopOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

#[async_trait]
/// Spawns one OS-level forwarding process per call.
pub trait TunnelLauncherPort: Send + Sync {
    async fn launch(&self, host: &Host, target: &ForwardTarget)
    -> AppResult<Arc<dyn ManagedProcess>>;
}
