// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gpufleetd::Fleet;
use gpufleetd::adapters::cli;
use gpufleetd::adapters::hosts::StaticHostRegistry;
use gpufleetd::adapters::notify::TracingNotifier;
use gpufleetd::adapters::snapshot::SnapshotStore;
use gpufleetd::adapters::ssh::SshAdapter;
use gpufleetd::adapters::ssh::tunnel::SshTunnelLauncher;
use gpufleetd::adapters::time::SystemClock;
use gpufleetd::app::gateway::CommandGateway;
use gpufleetd::app::monitor::TaskMonitor;
use gpufleetd::app::ports::ClockPort;
use gpufleetd::app::state_reader::StateReader;
use gpufleetd::app::tunnels::TunnelManager;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

mod config;
mod logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config snapshot_path: {} (source={})",
        report.snapshot_path.value.display(),
        report.snapshot_path.source.as_str()
    );
    tracing::info!(
        "config tick_interval_secs: {} (source={})",
        report.tick_interval_secs.value,
        report.tick_interval_secs.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
    tracing::info!("config hosts: {}", report.host_count);
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Dispatches watch evaluations, then writes the display snapshot. The
/// evaluations are not awaited: a watch on an unresponsive host stays in
/// flight while the others keep getting their regular ticks.
async fn scheduler_loop(
    fleet: Arc<Fleet>,
    store: SnapshotStore,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let dispatched = fleet.monitor().dispatch_tick().await;
        tracing::trace!(count = dispatched.len(), "watch evaluations dispatched");
        if let Err(err) = store.save(&fleet.snapshot().await).await {
            tracing::warn!("snapshot write failed: {err}");
        }
    }
}

async fn gpu_poll_loop(fleet: Arc<Fleet>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = fleet.refresh_gpu_states() => {}
        }
    }
}

async fn tunnel_health_loop(fleet: Arc<Fleet>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let dead = fleet.tunnels().check_health().await;
        if !dead.is_empty() {
            tracing::info!(count = dead.len(), "tunnels moved to error");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            snapshot_path: opts.snapshot_path,
            tick_interval_secs: opts.tick_interval_secs,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);
    if config.hosts.is_empty() {
        tracing::warn!("no hosts configured; add [[hosts]] tables to the config file");
    }

    let registry = Arc::new(
        StaticHostRegistry::new(config.hosts.clone()).context("invalid host registry")?,
    );
    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());
    let ssh = Arc::new(SshAdapter::with_defaults(config.ssh_settings()));
    let gateway = CommandGateway::new(registry.clone(), ssh);
    let reader = StateReader::new(gateway.clone(), clock.clone(), config.command_timeout());
    let monitor = Arc::new(TaskMonitor::new(
        reader.clone(),
        Arc::new(TracingNotifier::new()),
        clock.clone(),
        config.monitor_settings(),
    ));
    let launcher = Arc::new(SshTunnelLauncher::new(
        config.tunnels.ssh_binary.clone(),
        config.tunnels.sshpass_binary.clone(),
        config.ssh.known_hosts_path.clone(),
    ));
    let tunnels = Arc::new(TunnelManager::new(
        registry,
        launcher,
        clock.clone(),
        config.tunnel_settings(),
    ));
    let fleet = Arc::new(Fleet::new(gateway, reader, monitor, tunnels, clock));

    let store = SnapshotStore::new(config.snapshot_path.clone());
    match store.load().await {
        Ok(Some(previous)) => tracing::info!(
            written_at = %previous.written_at,
            watches = previous.watches.len(),
            tunnels = previous.tunnels.len(),
            "previous snapshot found; live state is rebuilt from probing"
        ),
        Ok(None) => {}
        Err(err) => tracing::warn!("ignoring unreadable snapshot: {err}"),
    }

    let shutdown = CancellationToken::new();
    let mut loops = JoinSet::new();
    loops.spawn(scheduler_loop(
        fleet.clone(),
        store.clone(),
        Duration::from_secs(config.tick_interval_secs),
        shutdown.clone(),
    ));
    loops.spawn(gpu_poll_loop(
        fleet.clone(),
        Duration::from_secs(config.monitor.gpu_poll_interval_secs),
        shutdown.clone(),
    ));
    loops.spawn(tunnel_health_loop(
        fleet.clone(),
        Duration::from_secs(config.tunnels.health_interval_secs),
        shutdown.clone(),
    ));
    tracing::info!("gpufleetd running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    while let Some(joined) = loops.join_next().await {
        if let Err(err) = joined {
            tracing::error!("background loop failed: {err}");
        }
    }

    fleet.shutdown().await;
    if let Err(err) = store.save(&fleet.snapshot().await).await {
        tracing::warn!("final snapshot write failed: {err}");
    }
    Ok(())
}
