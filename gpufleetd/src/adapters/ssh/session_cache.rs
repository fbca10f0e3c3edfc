// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::adapters::network;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::{Credential, Host};

use super::{SessionManager, SshAuth, SshParams, SshSettings};

pub trait SessionFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<SessionManager>;
}

#[derive(Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn build(&self, params: SshParams) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(params))
    }
}

/// One session per host name. A host whose connection parameters changed
/// gets a fresh session; the stale one is shut down.
pub struct SessionCache {
    sessions: RwLock<HashMap<String, Arc<SessionManager>>>,
    factory: Arc<dyn SessionFactory>,
}

impl SessionCache {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SessionManager>> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn remove_and_shutdown(&self, name: &str) -> bool {
        let session = self.sessions.write().await.remove(name);
        if let Some(session) = session {
            session.shutdown().await;
            return true;
        }
        false
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        let Some(session) = self.get(name).await else {
            return false;
        };
        session.is_connected_nonblocking()
    }

    /// Concurrent callers for the same host end up with the same session:
    /// the target is checked again under the write lock after DNS, and an
    /// entry is only replaced when its connection parameters differ.
    pub async fn get_or_create(
        &self,
        host: &Host,
        settings: &SshSettings,
    ) -> AppResult<Arc<SessionManager>> {
        if let Some(existing) = self.get(&host.name).await {
            if same_target(existing.params(), host) {
                return Ok(existing);
            }
        }

        let params = to_params(host, settings).await?;
        let (session, stale) = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions
                .get(&host.name)
                .filter(|existing| same_target(existing.params(), host))
            {
                return Ok(existing.clone());
            }
            let session = self.factory.build(params);
            let stale = sessions.insert(host.name.clone(), session.clone());
            (session, stale)
        };
        if let Some(stale) = stale {
            tracing::debug!(host = %host.name, "connection parameters changed, replacing session");
            stale.shutdown().await;
        }
        Ok(session)
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (name, session) in drained {
            tracing::debug!(host = %name, "closing ssh session");
            session.shutdown().await;
        }
    }
}

fn to_auth(credential: &Credential) -> SshAuth {
    match credential {
        Credential::Password(password) => SshAuth::Password(password.clone()),
        Credential::IdentityFile(path) => SshAuth::IdentityFile(path.clone()),
    }
}

fn same_target(params: &SshParams, host: &Host) -> bool {
    params.host == host.address.to_string()
        && params.addr.port() == host.port
        && params.username == host.username
        && params.auth == to_auth(&host.credential)
}

async fn to_params(host: &Host, settings: &SshSettings) -> AppResult<SshParams> {
    if host.username.trim().is_empty() {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("host {} has no username", host.name),
        ));
    }
    let addr = network::resolve_host_addr(&host.address, host.port, settings.connect_timeout)
        .await
        .map_err(|err| err.with_context(format!("host {}", host.name)))?;
    Ok(SshParams {
        host: host.address.to_string(),
        addr,
        username: host.username.clone(),
        auth: to_auth(&host.credential),
        connect_timeout: settings.connect_timeout,
        keepalive_secs: settings.keepalive_secs,
        known_hosts_path: settings.known_hosts_path.clone(),
    })
}
