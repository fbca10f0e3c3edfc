// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error as ThisError;
use tokio::net::lookup_host;

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("DNS name not found for {0}")]
    DnsNotFound(String),

    #[error("couldn't resolve host: {0}")]
    Resolve(io::Error),

    #[error("no addresses resolved from {0}")]
    NoAddrs(String),

    #[error("DNS lookup for {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },
}

pub async fn lookup_first_addr(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let mut addrs = lookup_host((host, port)).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => NetError::DnsNotFound(host.to_owned()),
        _ => NetError::Resolve(e),
    })?;
    addrs.next().ok_or_else(|| NetError::NoAddrs(host.to_owned()))
}

pub async fn lookup_first_addr_within(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<SocketAddr, NetError> {
    tokio::time::timeout(limit, lookup_first_addr(host, port))
        .await
        .map_err(|_| NetError::Timeout {
            host: host.to_owned(),
            after: limit,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_first_addr_resolves_localhost() {
        let addr = lookup_first_addr("localhost", 2222)
            .await
            .expect("localhost should resolve");
        assert_eq!(addr.port(), 2222);
    }

    #[tokio::test]
    async fn lookup_first_addr_errors_for_unknown_domain() {
        let host = "gpufleetd-should-not-exist.invalid";
        let err = lookup_first_addr(host, 22)
            .await
            .expect_err("invalid domain should fail");
        match err {
            NetError::DnsNotFound(value) | NetError::NoAddrs(value) => assert_eq!(value, host),
            NetError::Resolve(_) | NetError::Timeout { .. } => {}
        }
    }

    #[tokio::test]
    async fn bounded_lookup_resolves_localhost() {
        let addr = lookup_first_addr_within("localhost", 22, Duration::from_secs(5))
            .await
            .expect("localhost should resolve");
        assert_eq!(addr.port(), 22);
    }
}
