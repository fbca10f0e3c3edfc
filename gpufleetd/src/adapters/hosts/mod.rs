// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::HostRegistryPort;
use crate::app::types::Host;

/// Host registry backed by the hosts loaded at startup. Read-only.
#[derive(Debug, Clone, Default)]
pub struct StaticHostRegistry {
    hosts: Vec<Host>,
    by_name: HashMap<String, usize>,
}

impl StaticHostRegistry {
    pub fn new(hosts: Vec<Host>) -> AppResult<Self> {
        let mut by_name = HashMap::with_capacity(hosts.len());
        for (idx, host) in hosts.iter().enumerate() {
            if host.name.trim().is_empty() {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    "host name must not be empty",
                ));
            }
            if by_name.insert(host.name.clone(), idx).is_some() {
                return Err(AppError::with_message(
                    AppErrorKind::InvalidArgument,
                    codes::INVALID_ARGUMENT,
                    format!("duplicate host name: {}", host.name),
                ));
            }
        }
        Ok(Self { hosts, by_name })
    }
}

impl HostRegistryPort for StaticHostRegistry {
    fn list_hosts(&self) -> Vec<Host> {
        self.hosts.clone()
    }

    fn get_host(&self, name: &str) -> Option<Host> {
        self.by_name.get(name).map(|idx| self.hosts[*idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{Address, Credential};

    fn host(name: &str) -> Host {
        Host {
            name: name.to_string(),
            address: Address::parse("10.0.0.1"),
            port: 22,
            username: "ops".to_string(),
            credential: Credential::IdentityFile("~/.ssh/id_ed25519".to_string()),
            gpu_enabled: true,
            gpu_vendor: None,
            description: String::new(),
        }
    }

    #[test]
    fn looks_up_hosts_by_name_in_order() {
        let registry = StaticHostRegistry::new(vec![host("gpu-2"), host("gpu-1")]).unwrap();
        let names: Vec<String> = registry.list_hosts().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["gpu-2", "gpu-1"]);
        assert_eq!(registry.get_host("gpu-1").unwrap().name, "gpu-1");
        assert!(registry.get_host("gpu-3").is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = StaticHostRegistry::new(vec![host("gpu-1"), host("gpu-1")]).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
        assert!(err.message().contains("duplicate"));
    }
}
