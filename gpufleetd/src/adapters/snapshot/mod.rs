// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Best-effort JSON snapshot of the fleet for display warm start.
//! Never read back into the scheduler or the tunnel manager.

use std::io;
use std::path::{Path, PathBuf};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::FleetSnapshot;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

fn io_error(action: &str, path: &Path, err: io::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::INTERNAL_ERROR,
        format!("failed to {action} {}: {err}", path.display()),
    )
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Writes the snapshot atomically: temp file in the same directory, then rename.
    pub async fn save(&self, snapshot: &FleetSnapshot) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                format!("failed to encode snapshot: {err}"),
            )
        })?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| io_error("create directory", parent, err))?;
            }
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|err| io_error("write", &tmp, err))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| io_error("rename snapshot to", &self.path, err))?;
        tracing::trace!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Returns None when no snapshot was written yet.
    pub async fn load(&self) -> AppResult<Option<FleetSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read", &self.path, err)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            AppError::with_message(
                AppErrorKind::Parse,
                codes::PARSE_ERROR,
                format!("snapshot at {} is not valid: {err}", self.path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::HostSummary;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn snapshot() -> FleetSnapshot {
        FleetSnapshot {
            written_at: datetime!(2026-03-01 10:00 UTC),
            hosts: vec![HostSummary {
                name: "gpu-1".into(),
                address: "10.0.0.7".into(),
                port: 22,
                gpu_enabled: true,
                description: "4x A100".into(),
            }],
            gpus: Vec::new(),
            watches: Vec::new(),
            tunnels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("fleet.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_creates_parent_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("fleet.json");
        let store = SnapshotStore::new(&path);
        store.save(&snapshot()).await.unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("state").join("fleet.json.tmp").exists());
        let loaded = store.load().await.unwrap().expect("snapshot present");
        assert_eq!(loaded, snapshot());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = SnapshotStore::new(&path).load().await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Parse);
    }
}
