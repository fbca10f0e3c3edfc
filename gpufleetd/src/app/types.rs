// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Address for a host: either hostname or IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Ip(IpAddr),
    Hostname(String),
}

impl Address {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match IpAddr::from_str(raw) {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Hostname(raw.to_string()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{ip}"),
            Address::Hostname(host) => write!(f, "{host}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    IdentityFile(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// GPU tooling family present on a host. Picked once from the host's
/// configured vendor, or its descriptor when none is set, never re-matched
/// at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

impl GpuVendor {
    const NVIDIA_MARKERS: [&'static str; 20] = [
        "nvidia", "cuda", "dgx", "hgx", "tesla", "geforce", "quadro", "rtx", "gtx", "a10",
        "a30", "a40", "a100", "h100", "h200", "gh200", "b200", "l40", "l40s", "v100",
    ];
    const AMD_MARKERS: [&'static str; 10] = [
        "amd", "rocm", "radeon", "instinct", "mi100", "mi210", "mi250", "mi250x", "mi300",
        "mi300x",
    ];

    /// NVIDIA wins over AMD: "amd" alone usually names the CPU (EPYC) of an
    /// NVIDIA box, so it only counts when nothing names an NVIDIA part.
    pub fn from_descriptor(description: &str) -> Self {
        let lowered = description.to_ascii_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        let has = |markers: &[&str]| words.iter().any(|word| markers.contains(word));
        if has(&Self::NVIDIA_MARKERS) {
            GpuVendor::Nvidia
        } else if has(&Self::AMD_MARKERS) {
            GpuVendor::Amd
        } else {
            GpuVendor::Nvidia
        }
    }
}

/// Connection parameters for one remote machine. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Unique, short name (e.g. "gpu-1").
    pub name: String,
    pub address: Address,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub gpu_enabled: bool,
    /// Explicit tooling choice; the descriptor decides when unset.
    pub gpu_vendor: Option<GpuVendor>,
    pub description: String,
}

impl Host {
    pub fn gpu_vendor(&self) -> Option<GpuVendor> {
        self.gpu_enabled.then(|| {
            self.gpu_vendor
                .unwrap_or_else(|| GpuVendor::from_descriptor(&self.description))
        })
    }

    pub fn summary(&self) -> HostSummary {
        HostSummary {
            name: self.name.clone(),
            address: self.address.to_string(),
            port: self.port,
            gpu_enabled: self.gpu_enabled,
            description: self.description.clone(),
        }
    }
}

/// Credential-free view of a host for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSummary {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub gpu_enabled: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub used_memory_mb: u64,
    pub user: Option<String>,
}

/// State of one device at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub index: u32,
    pub uuid: Option<String>,
    pub name: String,
    pub temperature_c: Option<u32>,
    pub utilization_percent: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub processes: Vec<GpuProcess>,
}

impl GpuSnapshot {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0
    }
}

/// Result of one full GPU read against a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReading {
    pub host: String,
    pub vendor: GpuVendor,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
    pub devices: Vec<GpuSnapshot>,
    /// Lines of tool output that were dropped as garbled.
    pub skipped_lines: usize,
}

/// Most recent GPU state of a host, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostGpuState {
    pub host: String,
    pub reading: Option<GpuReading>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

pub type WatchId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WatchState::Completed | WatchState::TimedOut | WatchState::Failed | WatchState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WatchState::Pending => "Pending",
            WatchState::Running => "Running",
            WatchState::Completed => "Completed",
            WatchState::TimedOut => "TimedOut",
            WatchState::Failed => "Failed",
            WatchState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Pid,
    GpuIdle,
}

impl WatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchKind::Pid => "pid",
            WatchKind::GpuIdle => "gpu_idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchCondition {
    Pid {
        pid: u32,
        /// How long the process may take to show up before the watch fails.
        start_grace: Option<Duration>,
    },
    GpuIdle {
        device_index: u32,
        max_utilization_percent: u32,
        min_idle: Duration,
        /// Optional memory ceiling; the device must also stay under it.
        idle_memory_mb: Option<u64>,
        /// Only count idle time after the device was seen busy once.
        wait_for_busy: bool,
    },
}

impl WatchCondition {
    pub fn kind(&self) -> WatchKind {
        match self {
            WatchCondition::Pid { .. } => WatchKind::Pid,
            WatchCondition::GpuIdle { .. } => WatchKind::GpuIdle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub host: String,
    pub name: Option<String>,
    pub condition: WatchCondition,
    pub timeout: Option<Duration>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchUpdate {
    pub name: Option<String>,
    pub recipients: Option<Vec<String>>,
    pub timeout: Option<Option<Duration>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Watch has not reached a terminal state yet.
    NotDue,
    Skipped,
    Sent,
    Failed,
}

/// Progress a watch carries between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchProgress {
    pub process_seen: bool,
    pub gpu_seen_busy: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub idle_since: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    pub id: WatchId,
    pub name: String,
    pub host: String,
    pub condition: WatchCondition,
    pub timeout: Option<Duration>,
    pub recipients: Vec<String>,
    pub state: WatchState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_evaluated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Terminal result summary; written once on the terminal transition.
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub progress: WatchProgress,
    pub email_status: NotificationStatus,
    pub email_detail: Option<String>,
}

impl Watch {
    pub fn kind(&self) -> WatchKind {
        self.condition.kind()
    }
}

/// Structured body handed to the notification transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub watch_id: WatchId,
    pub name: String,
    pub host: String,
    pub kind: WatchKind,
    pub state: WatchState,
    pub detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl NotificationPayload {
    pub fn subject(&self) -> String {
        format!("[{}] {}: {}", self.host, self.name, self.state)
    }
}

pub type TunnelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl TunnelState {
    /// States that hold a local port and an OS process.
    pub fn is_active(self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Starting => "Starting",
            TunnelState::Running => "Running",
            TunnelState::Stopped => "Stopped",
            TunnelState::Error => "Error",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    TensorBoard,
    Mlflow,
    Jupyter,
    Wandb,
    Visdom,
    #[default]
    Custom,
}

impl ToolKind {
    pub const PRESETS: [ToolKind; 5] = [
        ToolKind::TensorBoard,
        ToolKind::Mlflow,
        ToolKind::Jupyter,
        ToolKind::Wandb,
        ToolKind::Visdom,
    ];

    pub fn default_port(self) -> Option<u16> {
        match self {
            ToolKind::TensorBoard => Some(6006),
            ToolKind::Mlflow => Some(5000),
            ToolKind::Jupyter => Some(8888),
            ToolKind::Wandb => Some(8080),
            ToolKind::Visdom => Some(8097),
            ToolKind::Custom => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::TensorBoard => "TensorBoard",
            ToolKind::Mlflow => "MLflow",
            ToolKind::Jupyter => "Jupyter",
            ToolKind::Wandb => "Weights & Biases",
            ToolKind::Visdom => "Visdom",
            ToolKind::Custom => "Custom",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::TensorBoard => "TensorFlow training dashboards",
            ToolKind::Mlflow => "ML experiment tracking",
            ToolKind::Jupyter => "Jupyter notebook server",
            ToolKind::Wandb => "Local W&B server",
            ToolKind::Visdom => "PyTorch live plots",
            ToolKind::Custom => "Any remote TCP service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPreset {
    pub tool: ToolKind,
    pub name: String,
    pub default_port: u16,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub host: String,
    pub remote_port: u16,
    pub local_port: Option<u16>,
    pub name: Option<String>,
    /// Target host as seen from the remote machine; defaults to localhost.
    pub remote_host: Option<String>,
    pub tool: ToolKind,
}

impl TunnelRequest {
    pub fn new(host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            host: host.into(),
            remote_port,
            local_port: None,
            name: None,
            remote_host: None,
            tool: ToolKind::Custom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub host: String,
    pub name: String,
    pub tool: ToolKind,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub state: TunnelState,
    pub pid: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub stopped_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// `codes::*` value classifying `last_error`.
    pub error_code: Option<String>,
    /// Non-fatal problems, e.g. a failed force-kill during stop.
    pub warning: Option<String>,
}

/// Everything the display layer needs, written best-effort to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
    pub hosts: Vec<HostSummary>,
    pub gpus: Vec<HostGpuState>,
    pub watches: Vec<Watch>,
    pub tunnels: Vec<Tunnel>,
}
