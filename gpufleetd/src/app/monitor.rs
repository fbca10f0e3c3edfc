// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, NotificationPort, SendStatus};
use crate::app::services::random::generate_id;
use crate::app::state_reader::StateReader;
use crate::app::types::{
    GpuReading, NotificationPayload, NotificationStatus, Watch, WatchCondition, WatchId,
    WatchProgress, WatchSpec, WatchState, WatchUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Consecutive failed evaluations before a watch is failed.
    pub max_consecutive_failures: u32,
    /// How long terminal watches stay listed before being pruned.
    pub retention: StdDuration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            retention: StdDuration::from_secs(3600),
        }
    }
}

struct WatchEntry {
    watch: Watch,
    /// Set while an evaluation for this watch is running.
    in_flight: Arc<AtomicBool>,
}

impl WatchEntry {
    fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Held by an evaluation task. Dropping it clears the in-flight flag, so a
/// panicked or aborted evaluation does not park the watch forever.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What one evaluation observed on the remote host.
enum Observation {
    Process { exists: bool },
    Gpu(GpuReading),
}

/// Periodic scheduler for PID and GPU-idle watches.
///
/// Each tick evaluates every non-terminal watch concurrently. A watch with an
/// evaluation still in flight is skipped, so evaluations of one watch never
/// overlap. Terminal transitions happen under the map lock and fire the
/// notification exactly once.
pub struct TaskMonitor {
    reader: StateReader,
    notifier: Arc<dyn NotificationPort>,
    clock: Arc<dyn ClockPort>,
    settings: MonitorSettings,
    watches: Mutex<HashMap<WatchId, WatchEntry>>,
}

fn elapsed(since: OffsetDateTime, now: OffsetDateTime) -> TimeDuration {
    now - since
}

fn to_time(duration: StdDuration) -> TimeDuration {
    TimeDuration::try_from(duration).unwrap_or(TimeDuration::MAX)
}

fn watch_not_found(id: &str) -> AppError {
    AppError::with_message(
        AppErrorKind::NotFound,
        codes::NOT_FOUND,
        format!("watch not found: {id}"),
    )
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::InvalidArgument, codes::INVALID_ARGUMENT, message)
}

fn default_name(condition: &WatchCondition) -> String {
    match condition {
        WatchCondition::Pid { pid, .. } => format!("pid {pid}"),
        WatchCondition::GpuIdle { device_index, .. } => format!("gpu {device_index} idle"),
    }
}

fn finish(watch: &mut Watch, state: WatchState, detail: String, now: OffsetDateTime) {
    watch.state = state;
    watch.finished_at = Some(now);
    watch.result = Some(detail);
    watch.progress.idle_since = None;
    if watch.recipients.is_empty() {
        watch.email_status = NotificationStatus::Skipped;
    }
}

fn payload(watch: &Watch) -> NotificationPayload {
    NotificationPayload {
        watch_id: watch.id.clone(),
        name: watch.name.clone(),
        host: watch.host.clone(),
        kind: watch.kind(),
        state: watch.state,
        detail: watch.result.clone().unwrap_or_default(),
        created_at: watch.created_at,
        finished_at: watch.finished_at.unwrap_or(watch.created_at),
    }
}

/// Applies one observation to a watch. Returns the terminal state it moved
/// into, if any.
fn advance(
    watch: &mut Watch,
    observation: AppResult<Observation>,
    now: OffsetDateTime,
    max_failures: u32,
) -> Option<WatchState> {
    if watch.state == WatchState::Pending {
        watch.state = WatchState::Running;
    }
    watch.last_evaluated_at = Some(now);
    let age = elapsed(watch.created_at, now);

    let resolved = match observation {
        Ok(observation) => {
            watch.progress.consecutive_failures = 0;
            watch.last_error = None;
            evaluate_condition(&watch.condition, &mut watch.progress, observation, age, now)
        }
        Err(err) => Err(err.to_string()),
    };

    match resolved {
        Ok(Some((state, detail))) => {
            finish(watch, state, detail, now);
            return Some(state);
        }
        Ok(None) => {}
        Err(message) => {
            watch.progress.consecutive_failures += 1;
            watch.last_error = Some(message.clone());
            if watch.progress.consecutive_failures >= max_failures {
                let detail = format!(
                    "giving up after {} consecutive failed checks: {message}",
                    watch.progress.consecutive_failures
                );
                finish(watch, WatchState::Failed, detail, now);
                return Some(WatchState::Failed);
            }
        }
    }

    match watch.timeout {
        Some(timeout) if age >= to_time(timeout) => {
            let detail = format!("not resolved within {}s", timeout.as_secs());
            finish(watch, WatchState::TimedOut, detail, now);
            Some(WatchState::TimedOut)
        }
        _ => None,
    }
}

/// `Ok(Some(..))` resolves the watch, `Ok(None)` keeps waiting and `Err`
/// counts as a failed check.
fn evaluate_condition(
    condition: &WatchCondition,
    progress: &mut WatchProgress,
    observation: Observation,
    age: TimeDuration,
    now: OffsetDateTime,
) -> Result<Option<(WatchState, String)>, String> {
    match (condition, observation) {
        (WatchCondition::Pid { pid, start_grace }, Observation::Process { exists }) => {
            if exists {
                progress.process_seen = true;
                return Ok(None);
            }
            if progress.process_seen || start_grace.is_none() {
                return Ok(Some((
                    WatchState::Completed,
                    format!("process {pid} is no longer running"),
                )));
            }
            match start_grace {
                Some(grace) if age >= to_time(*grace) => Ok(Some((
                    WatchState::Failed,
                    format!(
                        "process {pid} did not appear within {}s",
                        grace.as_secs()
                    ),
                ))),
                _ => Ok(None),
            }
        }
        (
            WatchCondition::GpuIdle {
                device_index,
                max_utilization_percent,
                min_idle,
                idle_memory_mb,
                wait_for_busy,
            },
            Observation::Gpu(reading),
        ) => {
            let Some(device) = reading.devices.iter().find(|d| d.index == *device_index) else {
                return Err(format!(
                    "gpu {device_index} not reported by {}",
                    reading.host
                ));
            };
            let over_memory = idle_memory_mb.is_some_and(|limit| device.memory_used_mb > limit);
            let busy = device.utilization_percent > *max_utilization_percent || over_memory;
            if busy {
                progress.gpu_seen_busy = true;
                progress.idle_since = None;
                return Ok(None);
            }
            if *wait_for_busy && !progress.gpu_seen_busy {
                return Ok(None);
            }
            let since = *progress.idle_since.get_or_insert(now);
            let idle_for = elapsed(since, now);
            if idle_for >= to_time(*min_idle) {
                return Ok(Some((
                    WatchState::Completed,
                    format!(
                        "gpu {device_index} idle for {}s ({}% utilization, {} MiB used)",
                        idle_for.whole_seconds(),
                        device.utilization_percent,
                        device.memory_used_mb
                    ),
                )));
            }
            Ok(None)
        }
        _ => Err("observation does not match watch kind".to_string()),
    }
}

impl TaskMonitor {
    pub fn new(
        reader: StateReader,
        notifier: Arc<dyn NotificationPort>,
        clock: Arc<dyn ClockPort>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            reader,
            notifier,
            clock,
            settings,
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_watch(&self, spec: WatchSpec) -> AppResult<WatchId> {
        let host = self.reader.host(&spec.host)?;
        if let WatchCondition::GpuIdle {
            max_utilization_percent,
            ..
        } = &spec.condition
        {
            if !host.gpu_enabled {
                return Err(invalid(format!("host {} is not GPU-enabled", host.name)));
            }
            if *max_utilization_percent > 100 {
                return Err(invalid("max_utilization_percent must be at most 100"));
            }
        }
        let name = match spec.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            Some(_) => return Err(invalid("watch name must not be empty")),
            None => default_name(&spec.condition),
        };

        let mut watches = self.watches.lock().await;
        let mut id = generate_id("watch");
        while watches.contains_key(&id) {
            id = generate_id("watch");
        }
        let watch = Watch {
            id: id.clone(),
            name,
            host: host.name,
            condition: spec.condition,
            timeout: spec.timeout,
            recipients: spec.recipients,
            state: WatchState::Pending,
            created_at: self.clock.now_utc(),
            last_evaluated_at: None,
            finished_at: None,
            result: None,
            last_error: None,
            progress: WatchProgress::default(),
            email_status: NotificationStatus::NotDue,
            email_detail: None,
        };
        tracing::info!(
            watch_id = %watch.id,
            host = %watch.host,
            kind = watch.kind().as_str(),
            "watch created"
        );
        watches.insert(
            id.clone(),
            WatchEntry {
                watch,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(id)
    }

    /// Cancelling a terminal watch is a no-op returning it unchanged.
    pub async fn cancel_watch(&self, id: &str) -> AppResult<Watch> {
        let now = self.clock.now_utc();
        let cancelled = {
            let mut watches = self.watches.lock().await;
            let entry = watches.get_mut(id).ok_or_else(|| watch_not_found(id))?;
            if entry.watch.state.is_terminal() {
                return Ok(entry.watch.clone());
            }
            finish(
                &mut entry.watch,
                WatchState::Cancelled,
                "cancelled by request".to_string(),
                now,
            );
            tracing::info!(watch_id = id, state = "Cancelled", "watch cancelled");
            entry.watch.clone()
        };
        self.notify(&cancelled).await;
        self.get_watch(id).await
    }

    pub async fn update_watch(&self, id: &str, update: WatchUpdate) -> AppResult<Watch> {
        let mut watches = self.watches.lock().await;
        let entry = watches.get_mut(id).ok_or_else(|| watch_not_found(id))?;
        if entry.watch.state.is_terminal() {
            return Err(invalid(format!(
                "watch {id} is already {}",
                entry.watch.state
            )));
        }
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(invalid("watch name must not be empty"));
            }
            entry.watch.name = name.trim().to_string();
        }
        if let Some(recipients) = update.recipients {
            entry.watch.recipients = recipients;
        }
        if let Some(timeout) = update.timeout {
            entry.watch.timeout = timeout;
        }
        Ok(entry.watch.clone())
    }

    /// Drops the record. A live watch ends as `Cancelled` without a notification.
    pub async fn remove_watch(&self, id: &str) -> AppResult<Watch> {
        let now = self.clock.now_utc();
        let mut watches = self.watches.lock().await;
        let mut entry = watches.remove(id).ok_or_else(|| watch_not_found(id))?;
        if !entry.watch.state.is_terminal() {
            finish(
                &mut entry.watch,
                WatchState::Cancelled,
                "removed".to_string(),
                now,
            );
            entry.watch.email_status = NotificationStatus::Skipped;
        }
        tracing::info!(watch_id = id, "watch removed");
        Ok(entry.watch)
    }

    pub async fn get_watch(&self, id: &str) -> AppResult<Watch> {
        let watches = self.watches.lock().await;
        watches
            .get(id)
            .map(|entry| entry.watch.clone())
            .ok_or_else(|| watch_not_found(id))
    }

    /// Oldest first, optionally limited to one host.
    pub async fn list_watches(&self, host: Option<&str>) -> Vec<Watch> {
        let watches = self.watches.lock().await;
        let mut list: Vec<Watch> = watches
            .values()
            .filter(|entry| host.is_none_or(|h| entry.watch.host == h))
            .map(|entry| entry.watch.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Starts one evaluation per idle, non-terminal watch and returns their
    /// handles. Watches still being evaluated from an earlier tick are
    /// skipped, so the periodic driver never has to wait on a slow host.
    pub async fn dispatch_tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let now = self.clock.now_utc();
        let due: Vec<(Watch, InFlight)> = {
            let mut watches = self.watches.lock().await;
            self.prune(&mut watches, now);
            watches
                .values_mut()
                .filter(|entry| !entry.watch.state.is_terminal() && !entry.is_in_flight())
                .map(|entry| {
                    entry.in_flight.store(true, Ordering::Release);
                    (entry.watch.clone(), InFlight(Arc::clone(&entry.in_flight)))
                })
                .collect()
        };
        due.into_iter()
            .map(|(watch, guard)| {
                let monitor = Arc::clone(self);
                tokio::spawn(async move { monitor.evaluate(watch, guard).await })
            })
            .collect()
    }

    /// Dispatch and wait for every evaluation to finish.
    pub async fn tick(self: &Arc<Self>) {
        for handle in self.dispatch_tick().await {
            if let Err(err) = handle.await {
                tracing::error!("watch evaluation task failed: {err}");
            }
        }
    }

    fn prune(&self, watches: &mut HashMap<WatchId, WatchEntry>, now: OffsetDateTime) {
        let retention = to_time(self.settings.retention);
        watches.retain(|id, entry| {
            let expired = !entry.is_in_flight()
                && entry
                    .watch
                    .finished_at
                    .is_some_and(|finished| elapsed(finished, now) >= retention);
            if expired {
                tracing::debug!(watch_id = %id, "pruning expired watch");
            }
            !expired
        });
    }

    async fn observe(&self, watch: &Watch) -> AppResult<Observation> {
        match &watch.condition {
            WatchCondition::Pid { pid, .. } => self
                .reader
                .process_exists(&watch.host, *pid)
                .await
                .map(|exists| Observation::Process { exists }),
            WatchCondition::GpuIdle { .. } => self
                .reader
                .read_gpu_snapshot(&watch.host)
                .await
                .map(Observation::Gpu),
        }
    }

    async fn evaluate(&self, snapshot: Watch, _in_flight: InFlight) {
        let observation = self.observe(&snapshot).await;
        if let Err(err) = &observation {
            tracing::warn!(
                watch_id = %snapshot.id,
                host = %snapshot.host,
                "watch check failed: {err}"
            );
        }
        let now = self.clock.now_utc();

        let finished = {
            let mut watches = self.watches.lock().await;
            // removed while the check was running
            let Some(entry) = watches.get_mut(&snapshot.id) else {
                return;
            };
            // cancelled while the check was running
            if entry.watch.state.is_terminal() {
                return;
            }
            match advance(
                &mut entry.watch,
                observation,
                now,
                self.settings.max_consecutive_failures,
            ) {
                Some(state) => {
                    tracing::info!(
                        watch_id = %entry.watch.id,
                        host = %entry.watch.host,
                        state = state.as_str(),
                        "watch finished"
                    );
                    entry.watch.clone()
                }
                None => return,
            }
        };
        self.notify(&finished).await;
    }

    /// Single best-effort send for a watch that just turned terminal.
    async fn notify(&self, watch: &Watch) {
        if watch.recipients.is_empty() {
            return;
        }
        let body = payload(watch);
        let report = self
            .notifier
            .send(&watch.recipients, &body.subject(), &body)
            .await;
        let status = match report.status {
            SendStatus::Sent => NotificationStatus::Sent,
            SendStatus::Failed => {
                tracing::warn!(
                    watch_id = %watch.id,
                    "notification failed: {}",
                    report.detail
                );
                NotificationStatus::Failed
            }
        };
        let mut watches = self.watches.lock().await;
        if let Some(entry) = watches.get_mut(&watch.id) {
            entry.watch.email_status = status;
            entry.watch.email_detail = Some(report.detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hosts::StaticHostRegistry;
    use crate::app::gateway::CommandGateway;
    use crate::app::ports::{ExecCapture, RemoteExecPort, SendReport};
    use crate::app::state_reader::tests::{ScriptedRemoteExec, capture, gpu_host};
    use crate::app::types::{Host, WatchKind};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct ManualClock(StdMutex<OffsetDateTime>);

    impl ManualClock {
        fn new() -> Self {
            Self(StdMutex::new(OffsetDateTime::UNIX_EPOCH + TimeDuration::days(20_000)))
        }

        fn advance(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += TimeDuration::seconds(secs);
        }
    }

    impl ClockPort for ManualClock {
        fn now_utc(&self) -> OffsetDateTime {
            *self.0.lock().unwrap()
        }
    }

    struct RecordingNotifier {
        sent: StdMutex<Vec<(Vec<String>, String, NotificationPayload)>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn new(fail: bool) -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                fail,
            }
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl NotificationPort for RecordingNotifier {
        async fn send(
            &self,
            recipients: &[String],
            subject: &str,
            body: &NotificationPayload,
        ) -> SendReport {
            self.sent.lock().unwrap().push((
                recipients.to_vec(),
                subject.to_string(),
                body.clone(),
            ));
            if self.fail {
                SendReport::failed("smtp: connection refused")
            } else {
                SendReport::sent("queued")
            }
        }
    }

    struct Harness {
        monitor: Arc<TaskMonitor>,
        remote: Arc<ScriptedRemoteExec>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(
        remote: Arc<dyn RemoteExecPort>,
        scripted: Arc<ScriptedRemoteExec>,
        fail_send: bool,
    ) -> Harness {
        let registry =
            StaticHostRegistry::new(vec![gpu_host("gpu-1", ""), gpu_host("gpu-2", "")]).unwrap();
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier::new(fail_send));
        let reader = StateReader::new(
            CommandGateway::new(Arc::new(registry), remote),
            clock.clone(),
            StdDuration::from_secs(5),
        );
        let monitor = Arc::new(TaskMonitor::new(
            reader,
            notifier.clone(),
            clock.clone(),
            MonitorSettings::default(),
        ));
        Harness {
            monitor,
            remote: scripted,
            clock,
            notifier,
        }
    }

    fn harness() -> Harness {
        let remote = Arc::new(ScriptedRemoteExec::default());
        harness_with(remote.clone(), remote, false)
    }

    fn pid_spec(pid: u32, start_grace: Option<u64>, timeout: Option<u64>) -> WatchSpec {
        WatchSpec {
            host: "gpu-1".to_string(),
            name: None,
            condition: WatchCondition::Pid {
                pid,
                start_grace: start_grace.map(StdDuration::from_secs),
            },
            timeout: timeout.map(StdDuration::from_secs),
            recipients: vec!["ops@example.org".to_string()],
        }
    }

    fn gpu_spec(min_idle: u64, wait_for_busy: bool) -> WatchSpec {
        WatchSpec {
            host: "gpu-1".to_string(),
            name: Some("train run".to_string()),
            condition: WatchCondition::GpuIdle {
                device_index: 0,
                max_utilization_percent: 10,
                min_idle: StdDuration::from_secs(min_idle),
                idle_memory_mb: None,
                wait_for_busy,
            },
            timeout: None,
            recipients: vec!["ops@example.org".to_string()],
        }
    }

    fn gpu_output(utilization: u32) -> AppResult<ExecCapture> {
        capture(
            0,
            &format!("0, GPU-a, A100, 40, {utilization}, 100, 81920\n"),
            "",
        )
    }

    fn script_gpu(remote: &ScriptedRemoteExec, utilization: u32) {
        remote.respond("nvidia-smi --query-gpu", gpu_output(utilization));
        remote.respond("nvidia-smi --query-compute-apps", capture(0, "", ""));
    }

    // ---------- pid watches ----------

    #[tokio::test]
    async fn pid_absent_on_first_tick_completes_and_notifies_once() {
        let h = harness();
        h.remote.respond("ps -p 4821", capture(1, "", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(4821, None, Some(120)))
            .await
            .unwrap();
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Pending);

        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Completed);
        assert_eq!(watch.email_status, NotificationStatus::Sent);

        h.clock.advance(15);
        h.monitor.tick().await;
        assert_eq!(h.notifier.count(), 1);
        let sent = h.notifier.sent.lock().unwrap();
        let (recipients, subject, body) = &sent[0];
        assert_eq!(recipients, &vec!["ops@example.org".to_string()]);
        assert_eq!(subject, "[gpu-1] pid 4821: Completed");
        assert_eq!(body.kind, WatchKind::Pid);
        assert_eq!(body.state, WatchState::Completed);
        assert_eq!(body.watch_id, id);
    }

    #[tokio::test]
    async fn pid_that_never_appears_fails_after_grace() {
        let h = harness();
        h.remote.respond("ps -p 77", capture(1, "", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(77, Some(30), None))
            .await
            .unwrap();

        h.monitor.tick().await;
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Running);

        h.clock.advance(31);
        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Failed);
        assert!(watch.result.unwrap().contains("did not appear"));
    }

    #[tokio::test]
    async fn pid_seen_then_gone_completes_and_stays_completed() {
        let h = harness();
        h.remote.respond("ps -p 90", capture(0, "90\n", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(90, Some(30), None))
            .await
            .unwrap();

        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Running);
        assert!(watch.progress.process_seen);

        h.remote.respond("ps -p 90", capture(1, "", ""));
        h.clock.advance(15);
        h.monitor.tick().await;
        let done = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(done.state, WatchState::Completed);

        // the pid reappearing must not revive a terminal watch
        h.remote.respond("ps -p 90", capture(0, "90\n", ""));
        h.clock.advance(15);
        h.monitor.tick().await;
        assert_eq!(h.monitor.get_watch(&id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn running_pid_times_out() {
        let h = harness();
        h.remote.respond("ps -p 5", capture(0, "5\n", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(5, None, Some(120)))
            .await
            .unwrap();

        h.clock.advance(60);
        h.monitor.tick().await;
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Running);

        h.clock.advance(61);
        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::TimedOut);
        assert_eq!(h.notifier.count(), 1);
    }

    // ---------- gpu idle watches ----------

    #[tokio::test]
    async fn busy_tick_resets_idle_streak() {
        let h = harness();
        let id = h.monitor.create_watch(gpu_spec(60, false)).await.unwrap();

        script_gpu(&h.remote, 2);
        h.monitor.tick().await; // idle since t0
        h.clock.advance(30);
        script_gpu(&h.remote, 85);
        h.monitor.tick().await; // busy, reset
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert!(watch.progress.idle_since.is_none());

        h.clock.advance(30);
        script_gpu(&h.remote, 3);
        h.monitor.tick().await; // idle since t60
        h.clock.advance(40);
        h.monitor.tick().await; // 40s idle
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Running);

        h.clock.advance(20);
        h.monitor.tick().await; // 60s idle
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Completed);
        assert!(watch.result.unwrap().starts_with("gpu 0 idle for 60s"));
    }

    #[tokio::test]
    async fn wait_for_busy_ignores_idle_before_first_busy_reading() {
        let h = harness();
        let id = h.monitor.create_watch(gpu_spec(0, true)).await.unwrap();

        script_gpu(&h.remote, 0);
        h.monitor.tick().await;
        h.clock.advance(30);
        h.monitor.tick().await;
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Running);

        script_gpu(&h.remote, 99);
        h.clock.advance(30);
        h.monitor.tick().await;
        script_gpu(&h.remote, 0);
        h.clock.advance(30);
        h.monitor.tick().await;
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Completed);
    }

    #[tokio::test]
    async fn watch_on_unknown_host_is_rejected() {
        let h = harness();
        let mut spec = gpu_spec(60, false);
        spec.host = "missing".to_string();
        let err = h.monitor.create_watch(spec).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
    }

    // ---------- failures ----------

    #[tokio::test]
    async fn repeated_failures_fail_the_watch_with_last_error() {
        let h = harness();
        let connection_error = AppError::with_message(
            AppErrorKind::Connection,
            codes::CONNECTION_FAILURE,
            "connection reset",
        );
        h.remote.respond("ps -p 8", Err(connection_error.clone()));
        let id = h
            .monitor
            .create_watch(pid_spec(8, None, None))
            .await
            .unwrap();

        for _ in 0..4 {
            h.monitor.tick().await;
            h.clock.advance(15);
        }
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Running);
        assert_eq!(watch.progress.consecutive_failures, 4);

        // a good reading resets the counter
        h.remote.respond("ps -p 8", capture(0, "8\n", ""));
        h.monitor.tick().await;
        assert_eq!(
            h.monitor.get_watch(&id).await.unwrap().progress.consecutive_failures,
            0
        );

        h.remote.respond("ps -p 8", Err(connection_error));
        for _ in 0..5 {
            h.clock.advance(15);
            h.monitor.tick().await;
        }
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Failed);
        assert!(watch.result.unwrap().contains("connection reset"));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_recorded_without_retry() {
        let remote = Arc::new(ScriptedRemoteExec::default());
        let h = harness_with(remote.clone(), remote, true);
        h.remote.respond("ps -p 3", capture(1, "", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(3, None, None))
            .await
            .unwrap();

        h.monitor.tick().await;
        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Completed);
        assert_eq!(watch.email_status, NotificationStatus::Failed);
        assert_eq!(watch.email_detail.as_deref(), Some("smtp: connection refused"));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn watch_without_recipients_skips_notification() {
        let h = harness();
        h.remote.respond("ps -p 3", capture(1, "", ""));
        let mut spec = pid_spec(3, None, None);
        spec.recipients.clear();
        let id = h.monitor.create_watch(spec).await.unwrap();

        h.monitor.tick().await;
        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.email_status, NotificationStatus::Skipped);
        assert_eq!(h.notifier.count(), 0);
    }

    // ---------- crud ----------

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_watches() {
        let h = harness();
        let id = h
            .monitor
            .create_watch(pid_spec(11, None, None))
            .await
            .unwrap();

        let cancelled = h.monitor.cancel_watch(&id).await.unwrap();
        assert_eq!(cancelled.state, WatchState::Cancelled);
        assert_eq!(h.notifier.count(), 1);

        h.clock.advance(5);
        let again = h.monitor.cancel_watch(&id).await.unwrap();
        assert_eq!(again, cancelled);
        assert_eq!(h.notifier.count(), 1);

        // no evaluation is dispatched for it
        assert!(h.monitor.dispatch_tick().await.is_empty());
        assert!(h.remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_edits_live_watch_and_rejects_terminal_one() {
        let h = harness();
        h.remote.respond("ps -p 12", capture(1, "", ""));
        let id = h
            .monitor
            .create_watch(pid_spec(12, None, None))
            .await
            .unwrap();

        let updated = h
            .monitor
            .update_watch(
                &id,
                WatchUpdate {
                    name: Some("eval job".to_string()),
                    recipients: Some(vec![]),
                    timeout: Some(Some(StdDuration::from_secs(600))),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "eval job");
        assert_eq!(updated.timeout, Some(StdDuration::from_secs(600)));

        h.monitor.tick().await;
        let err = h
            .monitor
            .update_watch(&id, WatchUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn remove_and_retention_prune() {
        let h = harness();
        h.remote.respond("ps -p", capture(1, "", ""));
        let live = h
            .monitor
            .create_watch(pid_spec(1, None, None))
            .await
            .unwrap();
        let removed = h.monitor.remove_watch(&live).await.unwrap();
        assert_eq!(removed.state, WatchState::Cancelled);
        assert_eq!(h.notifier.count(), 0);
        assert_eq!(
            h.monitor.get_watch(&live).await.unwrap_err().kind(),
            AppErrorKind::NotFound
        );

        let done = h
            .monitor
            .create_watch(pid_spec(2, None, None))
            .await
            .unwrap();
        h.monitor.tick().await;
        assert_eq!(h.monitor.list_watches(Some("gpu-1")).await.len(), 1);
        assert!(h.monitor.list_watches(Some("gpu-2")).await.is_empty());

        h.clock.advance(3599);
        h.monitor.tick().await;
        assert!(h.monitor.get_watch(&done).await.is_ok());
        h.clock.advance(1);
        h.monitor.tick().await;
        assert!(h.monitor.list_watches(None).await.is_empty());
    }

    // ---------- scheduling ----------

    /// Holds every command sent to `host` until released.
    struct GatedRemoteExec {
        host: &'static str,
        gate: Notify,
        inner: Arc<ScriptedRemoteExec>,
    }

    impl GatedRemoteExec {
        fn new(host: &'static str, inner: Arc<ScriptedRemoteExec>) -> Self {
            Self {
                host,
                gate: Notify::new(),
                inner,
            }
        }
    }

    #[async_trait::async_trait]
    impl RemoteExecPort for GatedRemoteExec {
        async fn exec_capture(
            &self,
            host: &Host,
            command: &str,
            timeout: StdDuration,
        ) -> AppResult<ExecCapture> {
            if host.name == self.host {
                self.gate.notified().await;
            }
            self.inner.exec_capture(host, command, timeout).await
        }

        async fn is_connected(&self, _host_name: &str) -> AppResult<bool> {
            Ok(true)
        }

        async fn remove_session(&self, _host_name: &str) -> AppResult<bool> {
            Ok(false)
        }

        async fn close_all(&self) {}
    }

    #[tokio::test]
    async fn in_flight_watch_is_not_dispatched_again() {
        let scripted = Arc::new(ScriptedRemoteExec::default());
        scripted.respond("ps -p 6", capture(0, "6\n", ""));
        let gated = Arc::new(GatedRemoteExec::new("gpu-1", scripted.clone()));
        let h = harness_with(gated.clone(), scripted, false);
        let id = h
            .monitor
            .create_watch(pid_spec(6, None, None))
            .await
            .unwrap();

        let first = h.monitor.dispatch_tick().await;
        assert_eq!(first.len(), 1);
        tokio::task::yield_now().await;
        assert!(h.monitor.dispatch_tick().await.is_empty());

        gated.gate.notify_one();
        for handle in first {
            handle.await.unwrap();
        }
        assert_eq!(h.remote.calls.lock().unwrap().len(), 1);
        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Running);
        assert_eq!(h.monitor.dispatch_tick().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_evaluation_wins() {
        let scripted = Arc::new(ScriptedRemoteExec::default());
        scripted.respond("ps -p 6", capture(1, "", ""));
        let gated = Arc::new(GatedRemoteExec::new("gpu-1", scripted.clone()));
        let h = harness_with(gated.clone(), scripted, false);
        let id = h
            .monitor
            .create_watch(pid_spec(6, None, None))
            .await
            .unwrap();

        let handles = h.monitor.dispatch_tick().await;
        tokio::task::yield_now().await;
        h.monitor.cancel_watch(&id).await.unwrap();
        gated.gate.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        let watch = h.monitor.get_watch(&id).await.unwrap();
        assert_eq!(watch.state, WatchState::Cancelled);
        assert_eq!(watch.result.as_deref(), Some("cancelled by request"));
        assert_eq!(h.notifier.count(), 1);
    }

    async fn wait_for_state(monitor: &TaskMonitor, id: &str, state: WatchState) {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while monitor.get_watch(id).await.unwrap().state != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("watch {id} never reached {state}"));
    }

    #[tokio::test]
    async fn slow_host_does_not_hold_back_other_watches() {
        let scripted = Arc::new(ScriptedRemoteExec::default());
        scripted.respond("ps -p 6", capture(0, "6\n", ""));
        scripted.respond("ps -p 7", capture(0, "7\n", ""));
        let gated = Arc::new(GatedRemoteExec::new("gpu-1", scripted.clone()));
        let h = harness_with(gated.clone(), scripted, false);
        let stuck = h
            .monitor
            .create_watch(pid_spec(6, None, None))
            .await
            .unwrap();
        let mut spec = pid_spec(7, None, None);
        spec.host = "gpu-2".to_string();
        let healthy = h.monitor.create_watch(spec).await.unwrap();

        let first = h.monitor.dispatch_tick().await;
        assert_eq!(first.len(), 2);
        wait_for_state(&h.monitor, &healthy, WatchState::Running).await;

        // gpu-1 is still hanging when the next tick comes round
        h.remote.respond("ps -p 7", capture(1, "", ""));
        h.clock.advance(15);
        let second = h.monitor.dispatch_tick().await;
        assert_eq!(second.len(), 1);
        wait_for_state(&h.monitor, &healthy, WatchState::Completed).await;
        assert_eq!(
            h.monitor.get_watch(&stuck).await.unwrap().state,
            WatchState::Pending
        );

        gated.gate.notify_one();
        for handle in first.into_iter().chain(second) {
            handle.await.unwrap();
        }
        assert_eq!(
            h.monitor.get_watch(&stuck).await.unwrap().state,
            WatchState::Running
        );
    }

    /// Panics on every command.
    struct PanickingRemoteExec;

    #[async_trait::async_trait]
    impl RemoteExecPort for PanickingRemoteExec {
        async fn exec_capture(
            &self,
            _host: &Host,
            command: &str,
            _timeout: StdDuration,
        ) -> AppResult<ExecCapture> {
            panic!("transport blew up on {command}")
        }

        async fn is_connected(&self, _host_name: &str) -> AppResult<bool> {
            Ok(true)
        }

        async fn remove_session(&self, _host_name: &str) -> AppResult<bool> {
            Ok(false)
        }

        async fn close_all(&self) {}
    }

    #[tokio::test]
    async fn panicked_evaluation_releases_the_watch() {
        let scripted = Arc::new(ScriptedRemoteExec::default());
        let h = harness_with(Arc::new(PanickingRemoteExec), scripted, false);
        let id = h
            .monitor
            .create_watch(pid_spec(9, None, None))
            .await
            .unwrap();

        let handles = h.monitor.dispatch_tick().await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert!(handle.await.unwrap_err().is_panic());
        }

        assert_eq!(h.monitor.get_watch(&id).await.unwrap().state, WatchState::Pending);
        assert_eq!(h.monitor.dispatch_tick().await.len(), 1);
    }

    #[tokio::test]
    async fn aborted_evaluation_releases_the_watch() {
        let scripted = Arc::new(ScriptedRemoteExec::default());
        scripted.respond("ps -p 6", capture(0, "6\n", ""));
        let gated = Arc::new(GatedRemoteExec::new("gpu-1", scripted.clone()));
        let h = harness_with(gated, scripted, false);
        h.monitor
            .create_watch(pid_spec(6, None, None))
            .await
            .unwrap();

        let handles = h.monitor.dispatch_tick().await;
        tokio::task::yield_now().await;
        assert!(h.monitor.dispatch_tick().await.is_empty());
        for handle in handles {
            handle.abort();
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        assert_eq!(h.monitor.dispatch_tick().await.len(), 1);
    }
}
