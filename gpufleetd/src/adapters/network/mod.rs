// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::time::Duration;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::Address;

mod net;

pub use net::NetError;

fn map_net_error(err: net::NetError) -> AppError {
    let message = err.to_string();
    AppError::with_message(AppErrorKind::Connection, codes::NETWORK_ERROR, message)
}

/// Resolves a host address to the socket the SSH client dials, giving DNS
/// at most `limit`. IP addresses never touch DNS.
pub async fn resolve_host_addr(
    address: &Address,
    port: u16,
    limit: Duration,
) -> AppResult<SocketAddr> {
    match address {
        Address::Ip(ip) => Ok(SocketAddr::new(*ip, port)),
        Address::Hostname(host) => net::lookup_first_addr_within(host, port, limit)
            .await
            .map_err(map_net_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_address_resolves_without_dns() {
        let addr = resolve_host_addr(&Address::parse("10.0.0.7"), 2200, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(addr, "10.0.0.7:2200".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn unknown_hostname_is_a_connection_error() {
        let err = resolve_host_addr(
            &Address::parse("gpufleetd-nope.invalid"),
            22,
            Duration::from_secs(10),
        )
        .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Connection);
        assert_eq!(err.code(), codes::NETWORK_ERROR);
    }
}
