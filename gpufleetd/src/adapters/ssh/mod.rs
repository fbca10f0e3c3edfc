// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteExecPort};
use crate::app::types::Host;

mod error;
mod session;

pub mod session_cache;
pub mod tunnel;

use session_cache::{DefaultSessionFactory, SessionCache};

pub use error::{AuthenticationFailure, HostKeyMismatch};
pub use session::{SessionManager, SshAuth, SshParams};

/// Connection policy shared by every cached session.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Connect attempts per command before giving up; auth failures stop early.
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub keepalive_secs: u64,
    /// Liveness probe bound for a cached connection before it is reused.
    pub probe_timeout: Duration,
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            backoff_base: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            keepalive_secs: 60,
            probe_timeout: Duration::from_secs(5),
            known_hosts_path: None,
        }
    }
}

#[derive(Clone)]
pub struct SshAdapter {
    sessions: Arc<SessionCache>,
    settings: SshSettings,
}

impl SshAdapter {
    pub fn new(sessions: Arc<SessionCache>, settings: SshSettings) -> Self {
        Self { sessions, settings }
    }

    pub fn with_defaults(settings: SshSettings) -> Self {
        let factory = Arc::new(DefaultSessionFactory);
        let sessions = Arc::new(SessionCache::new(factory));
        Self::new(sessions, settings)
    }

    /// Reuses a live connection, otherwise (re)connects with bounded retries.
    async fn ensure_ready(&self, session: &SessionManager) -> AppResult<()> {
        if !session.needs_connect().await {
            if session.probe(self.settings.probe_timeout).await {
                return Ok(());
            }
            tracing::info!(
                host = %session.params().host,
                "cached ssh connection is dead, reconnecting"
            );
            session.shutdown().await;
        }
        with_backoff(
            self.settings.connect_attempts,
            self.settings.backoff_base,
            || session.ensure_connected(),
        )
        .await
        .map_err(|err| map_connect_error(&session.params().host, err))
    }
}

fn is_auth_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<AuthenticationFailure>())
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<AuthenticationFailure>() || cause.is::<HostKeyMismatch>())
}

fn map_connect_error(host: &str, err: anyhow::Error) -> AppError {
    if is_auth_failure(&err) {
        AppError::with_message(
            AppErrorKind::Auth,
            codes::AUTHENTICATION_FAILURE,
            format!("ssh authentication to {host} rejected"),
        )
    } else {
        AppError::with_message(
            AppErrorKind::Connection,
            codes::CONNECTION_FAILURE,
            format!("ssh connect to {host} failed: {err:#}"),
        )
    }
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Connection,
        codes::CONNECTION_FAILURE,
        format!("ssh exec failed: {err:#}"),
    )
}

/// Exponential backoff: `base`, `2*base`, `4*base`, ...
fn backoff_delay(base: Duration, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Runs `op` up to `attempts` times, sleeping between failures.
/// Authentication and host key failures are returned immediately.
async fn with_backoff<T, F, Fut>(attempts: u32, base: Duration, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut failed = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failed += 1;
                if is_fatal(&err) || failed >= attempts {
                    return Err(err);
                }
                let delay = backoff_delay(base, failed);
                tracing::debug!(
                    attempt = failed,
                    delay_ms = delay.as_millis() as u64,
                    "ssh connect failed, retrying: {err:#}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[async_trait]
impl RemoteExecPort for SshAdapter {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, host, command),
        fields(op = "exec_capture", host = %host.name, user = %host.username, port = host.port)
    )]
    async fn exec_capture(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> AppResult<ExecCapture> {
        let session = self.sessions.get_or_create(host, &self.settings).await?;
        self.ensure_ready(&session).await?;

        let started = Instant::now();
        let (stdout, stderr, exit_code) =
            match tokio::time::timeout(timeout, session.exec_capture(command)).await {
                Ok(result) => result.map_err(map_exec_error)?,
                Err(_) => {
                    return Err(AppError::with_message(
                        AppErrorKind::Timeout,
                        codes::TIMEOUT,
                        format!("command did not finish within {}s", timeout.as_secs_f64()),
                    )
                    .with_context(format!("host {}", host.name)));
                }
            };
        let duration = started.elapsed();
        tracing::debug!(
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "command finished"
        );
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }

    async fn is_connected(&self, host_name: &str) -> AppResult<bool> {
        Ok(self.sessions.is_connected(host_name).await)
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "remove_session"))]
    async fn remove_session(&self, host_name: &str) -> AppResult<bool> {
        Ok(self.sessions.remove_and_shutdown(host_name).await)
    }

    async fn close_all(&self) {
        self.sessions.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_per_failure() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
    }

    #[test]
    fn auth_failure_maps_to_auth_kind() {
        let err = anyhow::Error::new(AuthenticationFailure).context("SSH connect failed");
        let mapped = map_connect_error("10.0.0.7", err);
        assert_eq!(mapped.kind(), AppErrorKind::Auth);
        assert_eq!(mapped.code(), codes::AUTHENTICATION_FAILURE);

        let mapped = map_connect_error("10.0.0.7", anyhow!("connection refused"));
        assert_eq!(mapped.kind(), AppErrorKind::Connection);
        assert!(mapped.message().contains("connection refused"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("no route to host")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::Error::new(AuthenticationFailure)) }
        })
        .await;
        assert!(is_auth_failure(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_key_mismatch_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(anyhow::Error::new(HostKeyMismatch {
                    host: "gpu-1.lab".into(),
                    port: 22,
                    detail: "key changed".into(),
                }))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
