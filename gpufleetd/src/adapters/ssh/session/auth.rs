// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::client::{AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::PrivateKeyWithHashAlg;
use std::sync::Arc;

use crate::adapters::ssh::AuthenticationFailure;

use super::{ClientHandler, SessionManager, SshAuth};

/// Rounds of keyboard-interactive prompts answered before giving up.
const MAX_KI_ROUNDS: usize = 5;

enum AuthDecision {
    Success,
    KeyboardInteractive,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods, ..
        } if remaining_methods.contains(&russh::MethodKind::KeyboardInteractive) => {
            AuthDecision::KeyboardInteractive
        }
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

/// Every prompt gets the stored password; servers using keyboard-interactive
/// for plain password auth ask exactly one question.
fn answers_for(prompts: usize, password: &str) -> Vec<String> {
    vec![password.to_string(); prompts]
}

impl SessionManager {
    /// Ensure we have a connected & authenticated handle.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;

        // If handle exists but is closed, drop it so we reconnect.
        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            return Ok(());
        }

        log::info!(
            "establishing connection with {}@{}",
            &self.params.username,
            &self.params.addr
        );
        let handler = ClientHandler::new(
            self.params.host.clone(),
            self.params.addr,
            self.params.known_hosts_path.clone(),
        );
        let connect = russh::client::connect(self.config.clone(), self.params.addr, handler);
        let mut handle = tokio::time::timeout(self.params.connect_timeout, connect)
            .await
            .map_err(|_| {
                anyhow!(
                    "SSH connect to {} timed out after {}s",
                    self.params.addr,
                    self.params.connect_timeout.as_secs()
                )
            })?
            .context("SSH connect failed")?;
        log::debug!(
            "established connection with {}@{}, proceeding with auth",
            &self.params.username,
            &self.params.addr
        );

        match &self.params.auth {
            SshAuth::IdentityFile(path) => {
                let path = shellexpand::tilde(path).into_owned();
                let key = russh::keys::load_secret_key(&path, None)
                    .with_context(|| format!("failed to load secret key at {path}"))?;
                // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
                let pk = PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    handle.best_supported_rsa_hash().await?.flatten(),
                );
                let result = handle
                    .authenticate_publickey(self.params.username.clone(), pk)
                    .await?;
                match auth_decision(result) {
                    AuthDecision::Success => {}
                    AuthDecision::KeyboardInteractive | AuthDecision::Failure => {
                        return Err(AuthenticationFailure.into());
                    }
                }
            }
            SshAuth::Password(password) => {
                let result = handle
                    .authenticate_password(self.params.username.clone(), password.clone())
                    .await?;
                match auth_decision(result) {
                    AuthDecision::Success => {}
                    AuthDecision::KeyboardInteractive => {
                        self.do_keyboard_interactive(&mut handle, password).await?;
                    }
                    AuthDecision::Failure => return Err(AuthenticationFailure.into()),
                }
            }
        }

        *handle_field = Some(handle);
        drop(handle_field);

        // Start a keepalive pinger in the background
        if let Some(interval) = self.config.keepalive_interval {
            let handle_clone = self.handle.clone();
            let host = self.params.host.clone();
            let jh = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval / 2);
                loop {
                    ticker.tick().await;
                    let guard = handle_clone.lock().await;
                    let Some(handle) = guard.as_ref() else {
                        break;
                    };
                    if handle.is_closed() {
                        log::debug!("keepalive handle for {host} is closed");
                        break;
                    }
                    if let Err(e) = handle.send_keepalive(true).await {
                        log::debug!("error when sending a keepalive to {host}: {e}");
                    }
                }
            });
            if let Some(previous) = self.keepalive_task_handle.lock().await.replace(jh) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Answers keyboard-interactive prompts with the stored password
    /// until the server reports Success or Failure.
    async fn do_keyboard_interactive(
        &self,
        handle: &mut russh::client::Handle<ClientHandler>,
        password: &str,
    ) -> Result<()> {
        let mut ki = handle
            .authenticate_keyboard_interactive_start(self.params.username.clone(), None)
            .await
            .context("KI start failed")?;

        for _ in 0..MAX_KI_ROUNDS {
            match ki {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    log::debug!(
                        "authentication failed (partial_success={}, remaining={:?})",
                        partial_success,
                        remaining_methods
                    );
                    return Err(AuthenticationFailure.into());
                }
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    ki = handle
                        .authenticate_keyboard_interactive_respond(answers_for(
                            prompts.len(),
                            password,
                        ))
                        .await
                        .context("KI respond failed")?;
                }
            }
        }
        log::debug!("giving up after {MAX_KI_ROUNDS} keyboard-interactive rounds");
        Err(AuthenticationFailure.into())
    }
}
