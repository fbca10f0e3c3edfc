// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::types::NotificationPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub status: SendStatus,
    pub detail: String,
}

impl SendReport {
    pub fn sent(detail: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Sent,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            detail: detail.into(),
        }
    }
}

#[async_trait]
/// Outbound notification transport (e-mail in production).
/// Single attempt; the status is only read back for bookkeeping.
pub trait NotificationPort: Send + Sync {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &NotificationPayload,
    ) -> SendReport;
}
