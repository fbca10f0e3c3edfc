// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

/// Credentials were rejected by the server. Never retried.
#[derive(Debug, ThisError)]
#[error("authentication_failure")]
pub struct AuthenticationFailure;

/// The server presented a key that differs from the known_hosts entry.
#[derive(Debug, ThisError)]
#[error("server key for {host}:{port} does not match known_hosts: {detail}")]
pub struct HostKeyMismatch {
    pub host: String,
    pub port: u16,
    pub detail: String,
}
