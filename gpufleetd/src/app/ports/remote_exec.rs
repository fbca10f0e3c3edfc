// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Host;

#[derive(Debug, Clone)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecCapture {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
/// Remote command execution and SSH session lifecycle boundary.
/// One cached session per host; reconnects are invisible to callers.
pub trait RemoteExecPort: Send + Sync {
    async fn exec_capture(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> AppResult<ExecCapture>;

    async fn is_connected(&self, host_name: &str) -> AppResult<bool>;

    async fn remove_session(&self, host_name: &str) -> AppResult<bool>;

    async fn close_all(&self);
}
