// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{ExecCapture, HostRegistryPort, RemoteExecPort};
use crate::app::types::Host;

/// Runs one command on a named host through the cached SSH sessions.
#[derive(Clone)]
pub struct CommandGateway {
    hosts: Arc<dyn HostRegistryPort>,
    remote: Arc<dyn RemoteExecPort>,
}

impl CommandGateway {
    pub fn new(hosts: Arc<dyn HostRegistryPort>, remote: Arc<dyn RemoteExecPort>) -> Self {
        Self { hosts, remote }
    }

    pub fn host(&self, host_id: &str) -> AppResult<Host> {
        self.hosts
            .get_host(host_id)
            .ok_or_else(|| AppError::host_not_found(host_id))
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.hosts.list_hosts()
    }

    /// Fails with `NotFound` before any network attempt when the host is unknown.
    pub async fn execute(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
    ) -> AppResult<ExecCapture> {
        let host = self.host(host_id)?;
        self.remote.exec_capture(&host, command, timeout).await
    }

    pub async fn is_connected(&self, host_id: &str) -> AppResult<bool> {
        self.host(host_id)?;
        self.remote.is_connected(host_id).await
    }

    pub async fn disconnect(&self, host_id: &str) -> AppResult<bool> {
        self.host(host_id)?;
        self.remote.remove_session(host_id).await
    }

    pub async fn close_all(&self) {
        self.remote.close_all().await;
    }
}
