// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Core of the GPU fleet supervisor: a cached SSH command gateway, GPU and
//! process state reading, a watch scheduler with notifications, and a
//! manager for `ssh -L` tunnel processes.

pub mod adapters;
pub mod app;

pub use app::errors::{AppError, AppErrorKind, AppResult};
pub use app::fleet::Fleet;
