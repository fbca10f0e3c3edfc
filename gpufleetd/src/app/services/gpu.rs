// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use thiserror::Error as ThisError;

use crate::app::types::{GpuProcess, GpuSnapshot, GpuVendor};

pub const NVIDIA_DEVICES_CMD: &str = "nvidia-smi --query-gpu=index,uuid,name,temperature.gpu,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits";
pub const NVIDIA_PROCESSES_CMD: &str =
    "nvidia-smi --query-compute-apps=gpu_uuid,pid,used_memory --format=csv,noheader,nounits";
pub const ROCM_DEVICES_CMD: &str =
    "rocm-smi --showproductname --showtemp --showuse --showmeminfo vram --csv";

const EXIT_COMMAND_NOT_FOUND: i32 = 127;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Command set for one GPU tooling family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuQuery {
    NvidiaSmi,
    RocmSmi,
}

impl From<GpuVendor> for GpuQuery {
    fn from(vendor: GpuVendor) -> Self {
        match vendor {
            GpuVendor::Nvidia => GpuQuery::NvidiaSmi,
            GpuVendor::Amd => GpuQuery::RocmSmi,
        }
    }
}

impl GpuQuery {
    pub fn tool(self) -> &'static str {
        match self {
            GpuQuery::NvidiaSmi => "nvidia-smi",
            GpuQuery::RocmSmi => "rocm-smi",
        }
    }

    pub fn devices_command(self) -> &'static str {
        match self {
            GpuQuery::NvidiaSmi => NVIDIA_DEVICES_CMD,
            GpuQuery::RocmSmi => ROCM_DEVICES_CMD,
        }
    }

    /// Per-process listing; rocm-smi has no stable machine-readable one.
    pub fn processes_command(self) -> Option<&'static str> {
        match self {
            GpuQuery::NvidiaSmi => Some(NVIDIA_PROCESSES_CMD),
            GpuQuery::RocmSmi => None,
        }
    }

    pub fn parse_devices(self, output: &str) -> Result<ParsedDevices, GpuParseError> {
        match self {
            GpuQuery::NvidiaSmi => parse_nvidia_devices(output),
            GpuQuery::RocmSmi => parse_rocm_devices(output),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum GpuParseError {
    #[error("no usable records in tool output ({skipped} lines skipped)")]
    NoRecords { skipped: usize },

    #[error("missing expected column: {0}")]
    MissingColumn(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDevices {
    pub devices: Vec<GpuSnapshot>,
    pub skipped_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProcesses {
    /// Keyed by device uuid.
    pub by_device: HashMap<String, Vec<GpuProcess>>,
    pub skipped_lines: usize,
}

/// True when the failure means the inspection tool itself is unusable.
pub fn is_missing_tool(exit_code: i32, stderr: &str) -> bool {
    if exit_code == EXIT_COMMAND_NOT_FOUND {
        return true;
    }
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("command not found")
        || lowered.contains("couldn't communicate with the nvidia driver")
        || lowered.contains("rocm-smi: not found")
        || lowered.contains("nvidia-smi: not found")
}

fn meaningful_lines(input: &str) -> impl Iterator<Item = &str> {
    input
        .lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty())
}

fn is_no_devices_line(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    lowered.starts_with("no devices were found") || lowered.starts_with("no running processes")
}

/// Accepts "42", "42 %", "1024 MiB".
fn leading_number<T: std::str::FromStr>(field: &str) -> Option<T> {
    field
        .split_whitespace()
        .next()?
        .trim_end_matches('%')
        .parse()
        .ok()
}

fn optional_number<T: std::str::FromStr>(field: &str) -> Option<T> {
    if field.starts_with('[') || field.eq_ignore_ascii_case("n/a") {
        return None;
    }
    leading_number(field)
}

fn parse_nvidia_device_line(line: &str) -> Option<GpuSnapshot> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 7 {
        return None;
    }
    Some(GpuSnapshot {
        index: leading_number(parts[0])?,
        uuid: Some(parts[1].to_string()).filter(|u| !u.is_empty()),
        name: parts[2].to_string(),
        temperature_c: optional_number(parts[3]),
        utilization_percent: leading_number(parts[4])?,
        memory_used_mb: leading_number(parts[5])?,
        memory_total_mb: leading_number(parts[6])?,
        processes: Vec::new(),
    })
}

/// Parse `nvidia-smi --query-gpu=... --format=csv,noheader,nounits`.
///
/// - Blank lines, a csv header and "No devices were found" are ignored
/// - Garbled lines are skipped and counted
/// - Empty output is a host without GPUs, not an error
pub fn parse_nvidia_devices(input: &str) -> Result<ParsedDevices, GpuParseError> {
    let mut devices = Vec::new();
    let mut skipped = 0;
    for line in meaningful_lines(input) {
        if line.starts_with("index") || is_no_devices_line(line) {
            continue;
        }
        match parse_nvidia_device_line(line) {
            Some(device) => devices.push(device),
            None => skipped += 1,
        }
    }
    if devices.is_empty() && skipped > 0 {
        return Err(GpuParseError::NoRecords { skipped });
    }
    Ok(ParsedDevices {
        devices,
        skipped_lines: skipped,
    })
}

/// Parse `nvidia-smi --query-compute-apps=gpu_uuid,pid,used_memory`.
pub fn parse_nvidia_processes(input: &str) -> ParsedProcesses {
    let mut by_device: HashMap<String, Vec<GpuProcess>> = HashMap::new();
    let mut skipped = 0;
    for line in meaningful_lines(input) {
        if line.starts_with("gpu_uuid") || is_no_devices_line(line) {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = match parts.as_slice() {
            [uuid, pid, mem] if !uuid.is_empty() => leading_number::<u32>(pid).map(|pid| {
                (
                    uuid.to_string(),
                    GpuProcess {
                        pid,
                        used_memory_mb: optional_number(mem).unwrap_or(0),
                        user: None,
                    },
                )
            }),
            _ => None,
        };
        match parsed {
            Some((uuid, process)) => by_device.entry(uuid).or_default().push(process),
            None => skipped += 1,
        }
    }
    ParsedProcesses {
        by_device,
        skipped_lines: skipped,
    }
}

struct RocmColumns {
    device: usize,
    name: Option<usize>,
    temperature: Option<usize>,
    utilization: usize,
    vram_total: usize,
    vram_used: usize,
}

impl RocmColumns {
    fn from_header(header: &str) -> Result<Self, GpuParseError> {
        let names: Vec<String> = header
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        let find = |pred: fn(&str) -> bool| names.iter().position(|n| pred(n.as_str()));
        Ok(Self {
            device: find(|n| n == "device").ok_or(GpuParseError::MissingColumn("device"))?,
            name: find(|n| n == "card series" || n == "card model"),
            temperature: find(|n| n.starts_with("temperature")),
            utilization: find(|n| n.starts_with("gpu use"))
                .ok_or(GpuParseError::MissingColumn("GPU use (%)"))?,
            vram_total: find(|n| n.starts_with("vram total memory"))
                .ok_or(GpuParseError::MissingColumn("VRAM Total Memory (B)"))?,
            vram_used: find(|n| n.starts_with("vram total used"))
                .ok_or(GpuParseError::MissingColumn("VRAM Total Used Memory (B)"))?,
        })
    }

    fn parse_row(&self, line: &str) -> Option<GpuSnapshot> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let get = |idx: usize| parts.get(idx).copied();
        let index = get(self.device)?.trim_start_matches("card").parse().ok()?;
        let utilization = leading_number::<f64>(get(self.utilization)?)?;
        let total: u64 = leading_number(get(self.vram_total)?)?;
        let used: u64 = leading_number(get(self.vram_used)?)?;
        Some(GpuSnapshot {
            index,
            uuid: None,
            name: self
                .name
                .and_then(get)
                .map(str::to_string)
                .unwrap_or_else(|| "AMD GPU".to_string()),
            temperature_c: self
                .temperature
                .and_then(get)
                .and_then(optional_number::<f64>)
                .map(|t| t.round() as u32),
            utilization_percent: utilization.round() as u32,
            memory_used_mb: used / BYTES_PER_MB,
            memory_total_mb: total / BYTES_PER_MB,
            processes: Vec::new(),
        })
    }
}

/// Parse `rocm-smi ... --csv`. Columns are located by header name since
/// their order varies between ROCm releases.
pub fn parse_rocm_devices(input: &str) -> Result<ParsedDevices, GpuParseError> {
    let mut lines = meaningful_lines(input).filter(|l| !l.starts_with("==="));
    let Some(header) = lines.next() else {
        return Ok(ParsedDevices {
            devices: Vec::new(),
            skipped_lines: 0,
        });
    };
    let columns = RocmColumns::from_header(header)?;
    let mut devices = Vec::new();
    let mut skipped = 0;
    for line in lines {
        match columns.parse_row(line) {
            Some(device) => devices.push(device),
            None => skipped += 1,
        }
    }
    if devices.is_empty() && skipped > 0 {
        return Err(GpuParseError::NoRecords { skipped });
    }
    Ok(ParsedDevices {
        devices,
        skipped_lines: skipped,
    })
}

/// Command listing the owner of each pid, one "pid user" pair per line.
pub fn process_owners_command(pids: &[u32]) -> Option<String> {
    if pids.is_empty() {
        return None;
    }
    let list: Vec<String> = pids.iter().map(u32::to_string).collect();
    Some(format!("ps -o pid=,user= -p {}", list.join(",")))
}

pub fn parse_process_owners(input: &str) -> HashMap<u32, String> {
    meaningful_lines(input)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let user = parts.next()?;
            Some((pid, user.to_string()))
        })
        .collect()
}

pub fn process_exists_command(pid: u32) -> String {
    format!("ps -p {pid} -o pid=")
}

/// `ps -p` prints the pid when the process exists and nothing otherwise.
pub fn parse_process_exists(pid: u32, output: &str) -> bool {
    meaningful_lines(output).any(|line| line.parse::<u32>().ok() == Some(pid))
}

/// Attach per-process records to the devices they run on.
pub fn attach_processes(
    devices: &mut [GpuSnapshot],
    mut processes: ParsedProcesses,
    owners: &HashMap<u32, String>,
) {
    for device in devices.iter_mut() {
        let Some(uuid) = device.uuid.as_deref() else {
            continue;
        };
        if let Some(mut procs) = processes.by_device.remove(uuid) {
            for process in procs.iter_mut() {
                process.user = owners.get(&process.pid).cloned();
            }
            device.processes = procs;
        }
    }
}
