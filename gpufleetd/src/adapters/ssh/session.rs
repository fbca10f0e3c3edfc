// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::anyhow;
use russh::client::Config;
use russh::keys::known_hosts::{learn_known_hosts, learn_known_hosts_path};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::HostKeyMismatch;

mod auth;
mod exec;

/// Minimal russh client handler; only the server key check is customised.
#[derive(Clone, Debug)]
struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts_path: Option<PathBuf>,
}

impl ClientHandler {
    fn new(host: String, addr: SocketAddr, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            host,
            addr,
            known_hosts_path,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(
            &self.host,
            self.addr,
            server_public_key,
            self.known_hosts_path.as_deref(),
        )
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    /// Path to a private key; `~` is expanded at connect time.
    IdentityFile(String),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    /// Original hostname or IP used for known_hosts lookup.
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub auth: SshAuth,
    pub connect_timeout: Duration,
    /// Send keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
    pub known_hosts_path: Option<PathBuf>,
}

fn check_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, russh::keys::Error> {
    match known_hosts_path {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    }
}

fn learn_known_hosts_for(
    host: &str,
    port: u16,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<(), russh::keys::Error> {
    match known_hosts_path {
        Some(path) => learn_known_hosts_path(host, port, key, path),
        None => learn_known_hosts(host, port, key),
    }
}

/// Accepts known keys, learns unknown ones and rejects changed ones.
fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts_path: Option<&Path>,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    let mismatch = |err: russh::keys::Error| {
        log::warn!("server key validation failed for {host}:{port}: {err}");
        anyhow::Error::new(HostKeyMismatch {
            host: host.to_string(),
            port,
            detail: err.to_string(),
        })
    };
    match check_known_hosts_for(host, port, key, known_hosts_path) {
        Ok(true) => return Ok(true),
        Ok(false) => {}
        Err(err) => return Err(mismatch(err)),
    }

    let ip_host = addr.ip().to_string();
    if ip_host != host {
        match check_known_hosts_for(&ip_host, port, key, known_hosts_path) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => return Err(mismatch(err)),
        }
    }

    let tried = if ip_host == host {
        host.to_string()
    } else {
        format!("{host}, {ip_host}")
    };
    log::info!(
        "server key for {host}:{port} is not present in known_hosts (tried {tried}); learning"
    );
    learn_known_hosts_for(host, port, key, known_hosts_path).map_err(|err| {
        log::warn!("failed to learn server key for {host}:{port}: {err}");
        anyhow!("failed to learn server key for {host}:{port}: {err}")
    })?;
    Ok(true)
}

/// Owns a single long-lived SSH connection to one host.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // held for the whole command, which serialises use of the connection
    handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs)),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn params(&self) -> &SshParams {
        &self.params
    }

    pub async fn needs_connect(&self) -> bool {
        let handle_field = self.handle.lock().await;
        match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        }
    }

    pub fn is_connected_nonblocking(&self) -> bool {
        let Ok(handle_field) = self.handle.try_lock() else {
            // a command is running on it
            return true;
        };
        match handle_field.as_ref() {
            None => false,
            Some(h) if h.is_closed() => false,
            Some(_) => true,
        }
    }

    /// Lightweight liveness probe: a keepalive round trip bounded by `timeout`.
    /// Returns false when there is no open connection.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let handle_field = self.handle.lock().await;
        let Some(handle) = handle_field.as_ref() else {
            return false;
        };
        if handle.is_closed() {
            return false;
        }
        match tokio::time::timeout(timeout, handle.send_keepalive(true)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                log::debug!("keepalive probe to {} failed: {err}", self.params.host);
                false
            }
            Err(_) => {
                log::debug!("keepalive probe to {} timed out", self.params.host);
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        if let Some(handle) = handle_field.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}
