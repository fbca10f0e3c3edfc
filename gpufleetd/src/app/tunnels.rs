// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    ClockPort, ForwardTarget, HostRegistryPort, ManagedProcess, StopOutcome, TunnelLauncherPort,
};
use crate::app::services::random::generate_id;
use crate::app::types::{ToolKind, ToolPreset, Tunnel, TunnelId, TunnelRequest, TunnelState};

const DEFAULT_REMOTE_HOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSettings {
    pub base_port: u16,
    pub max_port: u16,
    /// A process still alive after this long counts as a healthy tunnel.
    pub startup_grace: Duration,
    pub stop_grace: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            base_port: 16006,
            max_port: 20000,
            startup_grace: Duration::from_millis(1500),
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct TunnelEntry {
    tunnel: Tunnel,
    /// Present from a successful launch until the tunnel is stopped or dead.
    process: Option<Arc<dyn ManagedProcess>>,
}

impl TunnelEntry {
    fn holds(&self, process: &Arc<dyn ManagedProcess>) -> bool {
        self.process
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, process))
    }
}

/// Owns every port-forward and the OS process behind it.
pub struct TunnelManager {
    hosts: Arc<dyn HostRegistryPort>,
    launcher: Arc<dyn TunnelLauncherPort>,
    clock: Arc<dyn ClockPort>,
    settings: TunnelSettings,
    tunnels: Mutex<HashMap<TunnelId, TunnelEntry>>,
}

fn tunnel_not_found(id: &str) -> AppError {
    AppError::with_message(
        AppErrorKind::NotFound,
        codes::NOT_FOUND,
        format!("tunnel not found: {id}"),
    )
}

fn process_dead(reason: String) -> AppError {
    AppError::with_message(AppErrorKind::ProcessDead, codes::PROCESS_DEAD, reason)
}

/// Moves a tunnel to `Error` and releases its process handle.
fn fail_tunnel(entry: &mut TunnelEntry, err: &AppError, now: OffsetDateTime) {
    entry.tunnel.state = TunnelState::Error;
    entry.tunnel.last_error = Some(err.to_string());
    entry.tunnel.error_code = Some(err.code().to_string());
    entry.tunnel.stopped_at = Some(now);
    entry.tunnel.pid = None;
    entry.process = None;
}

fn port_unavailable(message: String) -> AppError {
    AppError::with_message(AppErrorKind::PortUnavailable, codes::PORT_UNAVAILABLE, message)
}

pub fn tool_presets() -> Vec<ToolPreset> {
    ToolKind::PRESETS
        .iter()
        .filter_map(|tool| {
            tool.default_port().map(|port| ToolPreset {
                tool: *tool,
                name: tool.display_name().to_string(),
                default_port: port,
                description: tool.description().to_string(),
            })
        })
        .collect()
}

impl TunnelManager {
    pub fn new(
        hosts: Arc<dyn HostRegistryPort>,
        launcher: Arc<dyn TunnelLauncherPort>,
        clock: Arc<dyn ClockPort>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            hosts,
            launcher,
            clock,
            settings,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    fn pick_port(
        &self,
        tunnels: &HashMap<TunnelId, TunnelEntry>,
        requested: Option<u16>,
    ) -> AppResult<u16> {
        let taken = |port: u16| {
            tunnels
                .values()
                .any(|e| e.tunnel.state.is_active() && e.tunnel.local_port == port)
        };
        match requested {
            Some(0) => Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "local port must not be 0",
            )),
            Some(port) if taken(port) => Err(port_unavailable(format!(
                "local port {port} is already used by another tunnel"
            ))),
            Some(port) => Ok(port),
            None => (self.settings.base_port..=self.settings.max_port)
                .find(|port| !taken(*port))
                .ok_or_else(|| {
                    port_unavailable(format!(
                        "no free local port in {}..={}",
                        self.settings.base_port, self.settings.max_port
                    ))
                }),
        }
    }

    /// Returns as soon as the process is spawned; the tunnel is `Starting`
    /// until it survives the startup grace window. A spawn failure still
    /// yields an id whose tunnel is in `Error`.
    pub async fn create_tunnel(self: &Arc<Self>, request: TunnelRequest) -> AppResult<TunnelId> {
        let host = self
            .hosts
            .get_host(&request.host)
            .ok_or_else(|| AppError::host_not_found(&request.host))?;
        if request.remote_port == 0 {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "remote port must not be 0",
            ));
        }
        let remote_host = request
            .remote_host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REMOTE_HOST.to_string());
        let name = request.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| {
            match request.tool {
                ToolKind::Custom => format!("{}:{}", host.name, request.remote_port),
                tool => format!("{} on {}", tool.display_name(), host.name),
            }
        });

        let (id, target) = {
            let mut tunnels = self.tunnels.lock().await;
            let local_port = self.pick_port(&tunnels, request.local_port)?;
            let mut id = generate_id("tunnel");
            while tunnels.contains_key(&id) {
                id = generate_id("tunnel");
            }
            let tunnel = Tunnel {
                id: id.clone(),
                host: host.name.clone(),
                name,
                tool: request.tool,
                remote_host: remote_host.clone(),
                remote_port: request.remote_port,
                local_port,
                state: TunnelState::Starting,
                pid: None,
                created_at: self.clock.now_utc(),
                started_at: None,
                stopped_at: None,
                last_error: None,
                error_code: None,
                warning: None,
            };
            tunnels.insert(
                id.clone(),
                TunnelEntry {
                    tunnel,
                    process: None,
                },
            );
            let target = ForwardTarget {
                local_port,
                remote_host,
                remote_port: request.remote_port,
            };
            (id, target)
        };

        tracing::info!(
            tunnel_id = %id,
            host = %host.name,
            local_port = target.local_port,
            remote = %format!("{}:{}", target.remote_host, target.remote_port),
            "starting tunnel"
        );

        let launched = self.launcher.launch(&host, &target).await;
        let orphan = {
            let mut tunnels = self.tunnels.lock().await;
            let orphan = match (launched, tunnels.get_mut(&id)) {
                (Err(err), Some(entry)) => {
                    tracing::warn!(tunnel_id = %id, "tunnel spawn failed: {err}");
                    if entry.tunnel.state == TunnelState::Starting {
                        fail_tunnel(entry, &err, self.clock.now_utc());
                    }
                    None
                }
                (Err(err), None) => {
                    tracing::debug!(tunnel_id = %id, "tunnel removed during failed spawn: {err}");
                    None
                }
                (Ok(process), Some(entry)) if entry.tunnel.state == TunnelState::Starting => {
                    entry.tunnel.pid = process.pid();
                    entry.process = Some(process);
                    let manager = Arc::clone(self);
                    let grace = self.settings.startup_grace;
                    let confirm_id = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        manager.confirm_started(&confirm_id).await;
                    });
                    None
                }
                // stopped or removed while spawning
                (Ok(process), _) => Some(process),
            };
            orphan
        };
        if let Some(process) = orphan {
            process.stop(self.settings.stop_grace).await;
        }
        Ok(id)
    }

    /// Promotes a `Starting` tunnel whose process is still alive, or moves it
    /// to `Error` with the exit reason.
    pub async fn confirm_started(&self, id: &str) {
        let process = {
            let tunnels = self.tunnels.lock().await;
            match tunnels.get(id) {
                Some(entry) if entry.tunnel.state == TunnelState::Starting => {
                    entry.process.clone()
                }
                _ => None,
            }
        };
        let Some(process) = process else {
            return;
        };
        let exited = process.try_exit().await;

        let mut tunnels = self.tunnels.lock().await;
        let Some(entry) = tunnels.get_mut(id) else {
            return;
        };
        if entry.tunnel.state != TunnelState::Starting || !entry.holds(&process) {
            return;
        }
        let now = self.clock.now_utc();
        match exited {
            None => {
                entry.tunnel.state = TunnelState::Running;
                entry.tunnel.started_at = Some(now);
                tracing::info!(tunnel_id = id, state = "Running", "tunnel is up");
            }
            Some(report) => {
                let err = process_dead(report.reason());
                tracing::warn!(
                    tunnel_id = id,
                    state = "Error",
                    "tunnel exited during startup: {err}"
                );
                fail_tunnel(entry, &err, now);
            }
        }
    }

    /// Liveness pass over `Running` tunnels. Returns the ids that died.
    pub async fn check_health(&self) -> Vec<TunnelId> {
        let running: Vec<(TunnelId, Arc<dyn ManagedProcess>)> = {
            let tunnels = self.tunnels.lock().await;
            tunnels
                .iter()
                .filter(|(_, e)| e.tunnel.state == TunnelState::Running)
                .filter_map(|(id, e)| e.process.clone().map(|p| (id.clone(), p)))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, process) in running {
            let Some(report) = process.try_exit().await else {
                continue;
            };
            let mut tunnels = self.tunnels.lock().await;
            let Some(entry) = tunnels.get_mut(&id) else {
                continue;
            };
            if entry.tunnel.state != TunnelState::Running || !entry.holds(&process) {
                continue;
            }
            let err = process_dead(report.reason());
            tracing::warn!(
                tunnel_id = %id,
                host = %entry.tunnel.host,
                state = "Error",
                "tunnel died: {err}"
            );
            fail_tunnel(entry, &err, self.clock.now_utc());
            dead.push(id);
        }
        dead
    }

    /// Always ends in `Stopped` for an active tunnel; stopping an inactive one
    /// returns it unchanged.
    pub async fn stop(&self, id: &str) -> AppResult<Tunnel> {
        let process = {
            let mut tunnels = self.tunnels.lock().await;
            let entry = tunnels.get_mut(id).ok_or_else(|| tunnel_not_found(id))?;
            if !entry.tunnel.state.is_active() {
                return Ok(entry.tunnel.clone());
            }
            match entry.process.take() {
                Some(process) => process,
                None => {
                    // launch still in flight; it stops the process once spawned
                    entry.tunnel.state = TunnelState::Stopped;
                    entry.tunnel.stopped_at = Some(self.clock.now_utc());
                    return Ok(entry.tunnel.clone());
                }
            }
        };

        let outcome = process.stop(self.settings.stop_grace).await;
        tracing::info!(tunnel_id = id, state = "Stopped", outcome = ?outcome, "tunnel stopped");

        let mut tunnels = self.tunnels.lock().await;
        let entry = tunnels.get_mut(id).ok_or_else(|| tunnel_not_found(id))?;
        entry.tunnel.state = TunnelState::Stopped;
        entry.tunnel.stopped_at = Some(self.clock.now_utc());
        entry.tunnel.pid = None;
        if let StopOutcome::KillFailed(message) = outcome {
            entry.tunnel.warning = Some(format!("force kill failed: {message}"));
        }
        Ok(entry.tunnel.clone())
    }

    /// Stops the tunnel if needed and forgets it.
    pub async fn remove(&self, id: &str) -> AppResult<Tunnel> {
        let stopped = self.stop(id).await?;
        let mut tunnels = self.tunnels.lock().await;
        tunnels.remove(id);
        tracing::info!(tunnel_id = id, "tunnel removed");
        Ok(stopped)
    }

    pub async fn status(&self, id: &str) -> AppResult<Tunnel> {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .get(id)
            .map(|entry| entry.tunnel.clone())
            .ok_or_else(|| tunnel_not_found(id))
    }

    pub async fn list_tunnels(&self, host: Option<&str>) -> Vec<Tunnel> {
        let tunnels = self.tunnels.lock().await;
        let mut list: Vec<Tunnel> = tunnels
            .values()
            .filter(|e| host.is_none_or(|h| e.tunnel.host == h))
            .map(|e| e.tunnel.clone())
            .collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.local_port.cmp(&b.local_port))
        });
        list
    }

    /// Stops every active tunnel concurrently.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let active: Vec<TunnelId> = {
            let tunnels = self.tunnels.lock().await;
            tunnels
                .iter()
                .filter(|(_, e)| e.tunnel.state.is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };
        if active.is_empty() {
            return;
        }
        tracing::info!(count = active.len(), "stopping tunnels");
        let mut stops = JoinSet::new();
        for id in active {
            let manager = Arc::clone(self);
            stops.spawn(async move { manager.stop(&id).await });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!("tunnel stop failed: {err}"),
                Err(err) => tracing::error!("tunnel stop task failed: {err}"),
            }
        }
    }
}
