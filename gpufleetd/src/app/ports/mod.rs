// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod host_registry;
pub mod notification;
pub mod process;
pub mod remote_exec;

pub use clock::ClockPort;
pub use host_registry::HostRegistryPort;
pub use notification::{NotificationPort, SendReport, SendStatus};
pub use process::{ExitReport, ForwardTarget, ManagedProcess, StopOutcome, TunnelLauncherPort};
pub use remote_exec::{ExecCapture, RemoteExecPort};
