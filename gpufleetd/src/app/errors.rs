// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const TIMEOUT: &str = "timeout";
    pub const PARSE_ERROR: &str = "parse_error";
    pub const DEPENDENCY_MISSING: &str = "dependency_missing";
    pub const PROCESS_SPAWN: &str = "process_spawn_failure";
    pub const PROCESS_DEAD: &str = "process_dead";
    pub const PORT_UNAVAILABLE: &str = "port_unavailable";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const HOST_NOT_FOUND: &str = "host_not_found";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_ERROR: &str = "remote_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Host unreachable or the transport broke; may recover later.
    Connection,
    /// Credentials rejected. Never retried automatically.
    Auth,
    Timeout,
    Parse,
    DependencyMissing,
    ProcessSpawn,
    ProcessDead,
    PortUnavailable,
    NotFound,
    InvalidArgument,
    Internal,
}

impl AppErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppErrorKind::Connection => "connection",
            AppErrorKind::Auth => "auth",
            AppErrorKind::Timeout => "timeout",
            AppErrorKind::Parse => "parse",
            AppErrorKind::DependencyMissing => "dependency_missing",
            AppErrorKind::ProcessSpawn => "process_spawn",
            AppErrorKind::ProcessDead => "process_dead",
            AppErrorKind::PortUnavailable => "port_unavailable",
            AppErrorKind::NotFound => "not_found",
            AppErrorKind::InvalidArgument => "invalid_argument",
            AppErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn host_not_found(host_id: &str) -> Self {
        Self::with_message(
            AppErrorKind::NotFound,
            codes::HOST_NOT_FOUND,
            format!("host not found: {host_id}"),
        )
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_when_present() {
        let err = AppError::with_message(AppErrorKind::Timeout, codes::TIMEOUT, "took too long")
            .with_context("gpu-1");
        assert_eq!(err.to_string(), "took too long (gpu-1)");
        assert_eq!(err.context(), Some("gpu-1"));
    }

    #[test]
    fn new_uses_code_as_message() {
        let err = AppError::new(AppErrorKind::Parse, codes::PARSE_ERROR);
        assert_eq!(err.message(), "parse_error");
        assert_eq!(err.kind(), AppErrorKind::Parse);
    }

    #[test]
    fn host_not_found_is_not_found_kind() {
        let err = AppError::host_not_found("gpu-9");
        assert_eq!(err.kind(), AppErrorKind::NotFound);
        assert_eq!(err.code(), codes::HOST_NOT_FOUND);
        assert!(err.message().contains("gpu-9"));
    }
}
