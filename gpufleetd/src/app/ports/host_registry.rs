// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::Host;

/// Read-only view of the configured hosts.
pub trait HostRegistryPort: Send + Sync {
    fn list_hosts(&self) -> Vec<Host>;
    fn get_host(&self, name: &str) -> Option<Host>;
}
