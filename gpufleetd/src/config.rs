// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use gpufleetd::adapters::ssh::SshSettings;
use gpufleetd::app::monitor::MonitorSettings;
use gpufleetd::app::tunnels::TunnelSettings;
use gpufleetd::app::types::{Address, Credential, GpuVendor, Host};
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const APP_DIR_NAME: &str = "gpufleet";
const CONFIG_FILE_NAME: &str = "gpufleet.toml";
const CONFIG_ENV_VAR: &str = "GPUFLEET_CONFIG_PATH";
const SNAPSHOT_FILE_NAME: &str = "snapshot.json";
const DEFAULT_TICK_INTERVAL_SECS: u64 = 15;
const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    snapshot_path: Option<String>,
    tick_interval_secs: Option<u64>,
    verbose: Option<bool>,
    #[serde(default)]
    monitor: MonitorConfig,
    #[serde(default)]
    tunnels: TunnelConfig,
    #[serde(default)]
    ssh: FileSshConfig,
    #[serde(default)]
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub max_consecutive_failures: u32,
    pub retention_secs: u64,
    pub command_timeout_secs: u64,
    pub gpu_poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            retention_secs: 3600,
            command_timeout_secs: 10,
            gpu_poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub base_port: u16,
    pub max_port: u16,
    pub startup_grace_ms: u64,
    pub stop_grace_secs: u64,
    pub health_interval_secs: u64,
    pub ssh_binary: String,
    pub sshpass_binary: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            base_port: 16006,
            max_port: 20000,
            startup_grace_ms: 1500,
            stop_grace_secs: 5,
            health_interval_secs: 5,
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSshConfig {
    connect_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    keepalive_secs: Option<u64>,
    known_hosts_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub known_hosts_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostEntry {
    name: String,
    address: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    identity_path: Option<String>,
    #[serde(default)]
    gpu_enabled: bool,
    /// "nvidia" or "amd"; guessed from `description` when absent.
    gpu_vendor: Option<GpuVendor>,
    #[serde(default)]
    description: String,
}

#[derive(Debug)]
pub struct Config {
    pub snapshot_path: PathBuf,
    pub tick_interval_secs: u64,
    pub verbose: bool,
    pub monitor: MonitorConfig,
    pub tunnels: TunnelConfig,
    pub ssh: SshConfig,
    pub hosts: Vec<Host>,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            max_consecutive_failures: self.monitor.max_consecutive_failures,
            retention: Duration::from_secs(self.monitor.retention_secs),
        }
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            base_port: self.tunnels.base_port,
            max_port: self.tunnels.max_port,
            startup_grace: Duration::from_millis(self.tunnels.startup_grace_ms),
            stop_grace: Duration::from_secs(self.tunnels.stop_grace_secs),
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            connect_attempts: self.ssh.connect_attempts,
            backoff_base: Duration::from_millis(self.ssh.backoff_base_ms),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            keepalive_secs: self.ssh.keepalive_secs,
            known_hosts_path: self.ssh.known_hosts_path.clone(),
            ..SshSettings::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub snapshot_path: ConfigValue<PathBuf>,
    pub tick_interval_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
    pub host_count: usize,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub snapshot_path: Option<PathBuf>,
    pub tick_interval_secs: Option<u64>,
    pub verbose: Option<bool>,
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (snapshot_path, snapshot_source) = match overrides.snapshot_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.snapshot_path.as_deref() {
            Some(raw) => (resolve_path(raw, base_dir), ConfigSource::ConfigFile),
            None => (
                default_snapshot_path().with_context(|| {
                    "failed to resolve default snapshot path; specify --snapshot-path or set snapshot_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (tick_interval_secs, tick_interval_source) = match overrides.tick_interval_secs {
        Some(secs) => (secs, ConfigSource::Override),
        None => match file_config.tick_interval_secs {
            Some(secs) => (secs, ConfigSource::ConfigFile),
            None => (DEFAULT_TICK_INTERVAL_SECS, ConfigSource::Default),
        },
    };
    if tick_interval_secs == 0 {
        anyhow::bail!("tick_interval_secs must be at least 1");
    }

    let (verbose, verbose_source) = match overrides.verbose {
        Some(verbose) => (verbose, ConfigSource::Override),
        None => match file_config.verbose {
            Some(verbose) => (verbose, ConfigSource::ConfigFile),
            None => (false, ConfigSource::Default),
        },
    };

    validate_monitor(&file_config.monitor)?;
    validate_tunnels(&file_config.tunnels)?;
    let ssh = to_ssh_config(file_config.ssh, base_dir)?;
    let hosts = to_hosts(file_config.hosts, base_dir)?;

    let config = Config {
        snapshot_path,
        tick_interval_secs,
        verbose,
        monitor: file_config.monitor,
        tunnels: file_config.tunnels,
        ssh,
        hosts,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        snapshot_path: ConfigValue {
            value: config.snapshot_path.clone(),
            source: snapshot_source,
        },
        tick_interval_secs: ConfigValue {
            value: config.tick_interval_secs,
            source: tick_interval_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
        host_count: config.hosts.len(),
    };

    Ok(LoadResult { config, report })
}

fn validate_monitor(monitor: &MonitorConfig) -> Result<()> {
    if monitor.max_consecutive_failures == 0 {
        anyhow::bail!("monitor.max_consecutive_failures must be at least 1");
    }
    if monitor.command_timeout_secs == 0 {
        anyhow::bail!("monitor.command_timeout_secs must be at least 1");
    }
    if monitor.gpu_poll_interval_secs == 0 {
        anyhow::bail!("monitor.gpu_poll_interval_secs must be at least 1");
    }
    Ok(())
}

fn validate_tunnels(tunnels: &TunnelConfig) -> Result<()> {
    if tunnels.base_port == 0 {
        anyhow::bail!("tunnels.base_port must be between 1 and 65535");
    }
    if tunnels.max_port < tunnels.base_port {
        anyhow::bail!(
            "tunnels.max_port ({}) must not be below tunnels.base_port ({})",
            tunnels.max_port,
            tunnels.base_port
        );
    }
    if tunnels.health_interval_secs == 0 {
        anyhow::bail!("tunnels.health_interval_secs must be at least 1");
    }
    if tunnels.ssh_binary.trim().is_empty() {
        anyhow::bail!("tunnels.ssh_binary must not be empty");
    }
    Ok(())
}

fn to_ssh_config(raw: FileSshConfig, base_dir: Option<&Path>) -> Result<SshConfig> {
    let defaults = SshSettings::default();
    let config = SshConfig {
        connect_attempts: raw.connect_attempts.unwrap_or(defaults.connect_attempts),
        backoff_base_ms: raw
            .backoff_base_ms
            .unwrap_or(defaults.backoff_base.as_millis() as u64),
        connect_timeout_secs: raw
            .connect_timeout_secs
            .unwrap_or(defaults.connect_timeout.as_secs()),
        keepalive_secs: raw.keepalive_secs.unwrap_or(defaults.keepalive_secs),
        known_hosts_path: raw
            .known_hosts_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
    };
    if config.connect_attempts == 0 {
        anyhow::bail!("ssh.connect_attempts must be at least 1");
    }
    if config.connect_timeout_secs == 0 || config.keepalive_secs == 0 {
        anyhow::bail!("ssh.connect_timeout_secs and ssh.keepalive_secs must be at least 1");
    }
    Ok(config)
}

fn to_hosts(entries: Vec<HostEntry>, base_dir: Option<&Path>) -> Result<Vec<Host>> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("hosts entry with address {:?} has an empty name", entry.address);
        }
        if !seen.insert(name.clone()) {
            anyhow::bail!("duplicate host name {name:?}");
        }
        if entry.address.trim().is_empty() {
            anyhow::bail!("host {name:?} has an empty address");
        }
        if entry.username.trim().is_empty() {
            anyhow::bail!("host {name:?} has an empty username");
        }
        let credential = match (entry.password, entry.identity_path) {
            (Some(password), None) => Credential::Password(password),
            (None, Some(path)) => {
                let path = resolve_path(&path, base_dir);
                Credential::IdentityFile(path.to_string_lossy().into_owned())
            }
            (Some(_), Some(_)) => {
                anyhow::bail!("host {name:?} sets both password and identity_path")
            }
            (None, None) => anyhow::bail!("host {name:?} needs a password or identity_path"),
        };
        let port = entry.port.unwrap_or(DEFAULT_SSH_PORT);
        if port == 0 {
            anyhow::bail!("host {name:?} port must be between 1 and 65535");
        }
        hosts.push(Host {
            name,
            address: Address::parse(&entry.address),
            port,
            username: entry.username,
            credential,
            gpu_enabled: entry.gpu_enabled,
            gpu_vendor: entry.gpu_vendor,
            description: entry.description,
        });
    }
    Ok(hosts)
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_snapshot_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(SNAPSHOT_FILE_NAME))
}
