// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Read-only facade for the display layer plus the shutdown sequence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;

use crate::app::gateway::CommandGateway;
use crate::app::monitor::TaskMonitor;
use crate::app::ports::ClockPort;
use crate::app::state_reader::StateReader;
use crate::app::tunnels::TunnelManager;
use crate::app::types::{FleetSnapshot, HostGpuState, HostSummary};

pub struct Fleet {
    gateway: CommandGateway,
    reader: StateReader,
    monitor: Arc<TaskMonitor>,
    tunnels: Arc<TunnelManager>,
    clock: Arc<dyn ClockPort>,
    gpu_states: RwLock<HashMap<String, HostGpuState>>,
}

impl Fleet {
    pub fn new(
        gateway: CommandGateway,
        reader: StateReader,
        monitor: Arc<TaskMonitor>,
        tunnels: Arc<TunnelManager>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            gateway,
            reader,
            monitor,
            tunnels,
            clock,
            gpu_states: RwLock::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Host summaries in registry order, credentials stripped.
    pub fn hosts(&self) -> Vec<HostSummary> {
        self.gateway.hosts().iter().map(|h| h.summary()).collect()
    }

    /// Reads every GPU-enabled host concurrently. A failed read keeps the
    /// previous reading and records the error next to it.
    pub async fn refresh_gpu_states(&self) {
        let mut reads = JoinSet::new();
        for host in self.gateway.hosts().into_iter().filter(|h| h.gpu_enabled) {
            let reader = self.reader.clone();
            reads.spawn(async move {
                let result = reader.read_gpu_snapshot(&host.name).await;
                (host.name, result)
            });
        }

        while let Some(joined) = reads.join_next().await {
            let (host, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!("gpu read task failed: {err}");
                    continue;
                }
            };
            let now = self.clock.now_utc();
            let mut states = self.gpu_states.write().await;
            let state = states.entry(host.clone()).or_insert_with(|| HostGpuState {
                host: host.clone(),
                reading: None,
                last_error: None,
                updated_at: now,
            });
            state.updated_at = now;
            match result {
                Ok(reading) => {
                    state.reading = Some(reading);
                    state.last_error = None;
                }
                Err(err) => {
                    tracing::debug!(host = %host, "gpu read failed: {err}");
                    state.last_error = Some(err.to_string());
                }
            }
        }
    }

    pub async fn gpu_state(&self, host: &str) -> Option<HostGpuState> {
        self.gpu_states.read().await.get(host).cloned()
    }

    pub async fn gpu_states(&self) -> Vec<HostGpuState> {
        let mut states: Vec<_> = self.gpu_states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.host.cmp(&b.host));
        states
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            written_at: self.clock.now_utc(),
            hosts: self.hosts(),
            gpus: self.gpu_states().await,
            watches: self.monitor.list_watches(None).await,
            tunnels: self.tunnels.list_tunnels(None).await,
        }
    }

    /// Stops every tunnel, then drops all cached SSH sessions.
    pub async fn shutdown(&self) {
        self.tunnels.shutdown_all().await;
        self.gateway.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hosts::StaticHostRegistry;
    use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
    use crate::app::monitor::MonitorSettings;
    use crate::app::ports::{
        ForwardTarget, ManagedProcess, NotificationPort, SendReport, TunnelLauncherPort,
    };
    use crate::app::state_reader::tests::{FixedClock, ScriptedRemoteExec, capture, gpu_host};
    use crate::app::tunnels::TunnelSettings;
    use crate::app::types::{Host, NotificationPayload};
    use std::time::Duration;
    use time::OffsetDateTime;

    struct NoLauncher;

    #[async_trait::async_trait]
    impl TunnelLauncherPort for NoLauncher {
        async fn launch(
            &self,
            _host: &Host,
            _target: &ForwardTarget,
        ) -> AppResult<Arc<dyn ManagedProcess>> {
            Err(AppError::new(
                AppErrorKind::DependencyMissing,
                codes::DEPENDENCY_MISSING,
            ))
        }
    }

    struct SilentNotifier;

    #[async_trait::async_trait]
    impl NotificationPort for SilentNotifier {
        async fn send(&self, _: &[String], _: &str, _: &NotificationPayload) -> SendReport {
            SendReport::sent("ok")
        }
    }

    fn fleet(remote: Arc<ScriptedRemoteExec>) -> Fleet {
        let mut cpu = gpu_host("cpu-1", "");
        cpu.gpu_enabled = false;
        let registry = Arc::new(
            StaticHostRegistry::new(vec![gpu_host("gpu-2", ""), gpu_host("gpu-1", ""), cpu])
                .unwrap(),
        );
        let clock: Arc<dyn ClockPort> = Arc::new(FixedClock(OffsetDateTime::UNIX_EPOCH));
        let gateway = CommandGateway::new(registry.clone(), remote);
        let reader = StateReader::new(gateway.clone(), clock.clone(), Duration::from_secs(5));
        let monitor = Arc::new(TaskMonitor::new(
            reader.clone(),
            Arc::new(SilentNotifier),
            clock.clone(),
            MonitorSettings::default(),
        ));
        let tunnels = Arc::new(TunnelManager::new(
            registry,
            Arc::new(NoLauncher),
            clock.clone(),
            TunnelSettings::default(),
        ));
        Fleet::new(gateway, reader, monitor, tunnels, clock)
    }

    #[test]
    fn hosts_are_listed_without_credentials() {
        let fleet = fleet(Arc::new(ScriptedRemoteExec::default()));
        let names: Vec<_> = fleet.hosts().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["gpu-2", "gpu-1", "cpu-1"]);
    }

    #[tokio::test]
    async fn refresh_reads_only_gpu_hosts() {
        let remote = Arc::new(ScriptedRemoteExec::default());
        remote.respond(
            "nvidia-smi --query-gpu",
            capture(0, "0, GPU-a, A100, 40, 12, 1000, 81920\n", ""),
        );
        remote.respond("nvidia-smi --query-compute-apps", capture(0, "", ""));
        let fleet = fleet(remote);

        fleet.refresh_gpu_states().await;
        let states = fleet.gpu_states().await;
        let hosts: Vec<_> = states.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(hosts, vec!["gpu-1", "gpu-2"]);
        let reading = states[0].reading.as_ref().expect("reading present");
        assert_eq!(reading.devices[0].utilization_percent, 12);
        assert!(fleet.gpu_state("cpu-1").await.is_none());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_reading() {
        let remote = Arc::new(ScriptedRemoteExec::default());
        remote.respond(
            "nvidia-smi --query-gpu",
            capture(0, "0, GPU-a, A100, 40, 12, 1000, 81920\n", ""),
        );
        remote.respond("nvidia-smi --query-compute-apps", capture(0, "", ""));
        let fleet = fleet(remote.clone());
        fleet.refresh_gpu_states().await;

        remote.respond(
            "nvidia-smi",
            Err(AppError::with_message(
                AppErrorKind::Connection,
                codes::CONNECTION_FAILURE,
                "no route to host",
            )),
        );
        fleet.refresh_gpu_states().await;

        let state = fleet.gpu_state("gpu-1").await.unwrap();
        assert!(state.reading.is_some());
        assert!(state.last_error.unwrap().contains("no route to host"));
    }

    #[tokio::test]
    async fn snapshot_collects_all_sections() {
        let fleet = fleet(Arc::new(ScriptedRemoteExec::default()));
        let snapshot = fleet.snapshot().await;
        assert_eq!(snapshot.hosts.len(), 3);
        assert!(snapshot.gpus.is_empty());
        assert!(snapshot.watches.is_empty());
        assert!(snapshot.tunnels.is_empty());
        assert_eq!(snapshot.written_at, OffsetDateTime::UNIX_EPOCH);
    }
}
