// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::gateway::CommandGateway;
use crate::app::ports::{ClockPort, ExecCapture};
use crate::app::services::gpu::{self, GpuQuery};
use crate::app::types::{GpuReading, Host};

/// Turns inspection command output into structured GPU/process state.
#[derive(Clone)]
pub struct StateReader {
    gateway: CommandGateway,
    clock: Arc<dyn ClockPort>,
    timeout: Duration,
}

fn dependency_missing(tool: &str, capture: &ExecCapture) -> AppError {
    AppError::with_message(
        AppErrorKind::DependencyMissing,
        codes::DEPENDENCY_MISSING,
        format!(
            "{tool} is not usable on the remote host (exit {}): {}",
            capture.exit_code,
            capture.stderr_lossy().trim()
        ),
    )
}

fn remote_failure(what: &str, capture: &ExecCapture) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::REMOTE_ERROR,
        format!(
            "{what} exited with code {}: {}",
            capture.exit_code,
            capture.stderr_lossy().trim()
        ),
    )
}

impl StateReader {
    pub fn new(gateway: CommandGateway, clock: Arc<dyn ClockPort>, timeout: Duration) -> Self {
        Self {
            gateway,
            clock,
            timeout,
        }
    }

    pub fn host(&self, host_id: &str) -> AppResult<Host> {
        self.gateway.host(host_id)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn read_gpu_snapshot(&self, host_id: &str) -> AppResult<GpuReading> {
        let host = self.gateway.host(host_id)?;
        let Some(vendor) = host.gpu_vendor() else {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("host {host_id} is not GPU-enabled"),
            ));
        };
        let query = GpuQuery::from(vendor);

        let capture = self
            .gateway
            .execute(host_id, query.devices_command(), self.timeout)
            .await?;
        if !capture.success() {
            if gpu::is_missing_tool(capture.exit_code, &capture.stderr_lossy()) {
                return Err(dependency_missing(query.tool(), &capture));
            }
            return Err(remote_failure(query.tool(), &capture));
        }
        let parsed = query
            .parse_devices(&capture.stdout_lossy())
            .map_err(|err| {
                AppError::with_message(AppErrorKind::Parse, codes::PARSE_ERROR, err.to_string())
                    .with_context(host_id.to_string())
            })?;
        let mut devices = parsed.devices;
        let mut skipped_lines = parsed.skipped_lines;

        if let Some(command) = query.processes_command().filter(|_| !devices.is_empty()) {
            match self.gateway.execute(host_id, command, self.timeout).await {
                Ok(capture) if capture.success() => {
                    let processes = gpu::parse_nvidia_processes(&capture.stdout_lossy());
                    skipped_lines += processes.skipped_lines;
                    let pids: Vec<u32> = processes
                        .by_device
                        .values()
                        .flatten()
                        .map(|p| p.pid)
                        .collect();
                    let owners = self.process_owners(host_id, &pids).await;
                    gpu::attach_processes(&mut devices, processes, &owners);
                }
                Ok(capture) => {
                    tracing::debug!(
                        host = host_id,
                        exit_code = capture.exit_code,
                        "gpu process listing failed; reporting devices only"
                    );
                }
                Err(err) => {
                    tracing::debug!(host = host_id, "gpu process listing failed: {err}");
                }
            }
        }

        if skipped_lines > 0 {
            tracing::warn!(
                host = host_id,
                skipped_lines,
                "skipped unparsable lines in gpu tool output"
            );
        }

        Ok(GpuReading {
            host: host_id.to_string(),
            vendor,
            read_at: self.clock.now_utc(),
            devices,
            skipped_lines,
        })
    }

    async fn process_owners(
        &self,
        host_id: &str,
        pids: &[u32],
    ) -> std::collections::HashMap<u32, String> {
        let Some(command) = gpu::process_owners_command(pids) else {
            return Default::default();
        };
        match self.gateway.execute(host_id, &command, self.timeout).await {
            // ps exits 1 when some pids already vanished; whatever it printed is still valid
            Ok(capture) => gpu::parse_process_owners(&capture.stdout_lossy()),
            Err(err) => {
                tracing::debug!(host = host_id, "process owner lookup failed: {err}");
                Default::default()
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn process_exists(&self, host_id: &str, pid: u32) -> AppResult<bool> {
        let capture = self
            .gateway
            .execute(host_id, &gpu::process_exists_command(pid), self.timeout)
            .await?;
        match capture.exit_code {
            0 => Ok(gpu::parse_process_exists(pid, &capture.stdout_lossy())),
            1 => Ok(false),
            code if gpu::is_missing_tool(code, &capture.stderr_lossy()) => {
                Err(dependency_missing("ps", &capture))
            }
            _ => Err(remote_failure("ps", &capture)),
        }
    }
}
