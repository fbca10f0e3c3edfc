// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::OffsetDateTime;

/// Source of "now" for every time-based decision: watch timeouts, start
/// grace windows, idle streaks and tunnel timestamps. Tests drive it by hand.
pub trait ClockPort: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}
