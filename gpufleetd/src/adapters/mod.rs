// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod cli;
pub mod hosts;
pub mod network;
pub mod notify;
pub mod process;
pub mod snapshot;
pub mod ssh;
pub mod time;
