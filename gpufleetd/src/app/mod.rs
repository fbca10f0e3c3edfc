// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod errors;
pub mod fleet;
pub mod gateway;
pub mod monitor;
pub mod ports;
pub mod services;
pub mod state_reader;
pub mod tunnels;
pub mod types;
