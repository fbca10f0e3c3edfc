// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Notification sink used when no mail transport is wired in: every
//! notification becomes a structured log event.

use async_trait::async_trait;

use crate::app::ports::{NotificationPort, SendReport};
use crate::app::types::NotificationPayload;

#[derive(Clone, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationPort for TracingNotifier {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &NotificationPayload,
    ) -> SendReport {
        let payload = match serde_json::to_string(body) {
            Ok(payload) => payload,
            Err(err) => return SendReport::failed(format!("failed to encode payload: {err}")),
        };
        tracing::info!(
            target: "gpufleetd::notify",
            watch_id = %body.watch_id,
            host = %body.host,
            state = %body.state,
            recipients = %recipients.join(","),
            subject,
            payload = %payload,
        );
        SendReport::sent(format!("logged for {} recipient(s)", recipients.len()))
    }
}
