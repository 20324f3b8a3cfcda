// Progress Stream Relay - one running operation, many observers

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

const EMIT_INTERVAL: Duration = Duration::from_millis(250);
const EMIT_PERCENT_STEP: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub percent: f64,
    pub current_file: Option<String>,
    pub files_done: u64,
    pub files_total: Option<u64>,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub bytes_per_second: f64,
    pub estimated_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress(ProgressSnapshot),
    Complete(ProgressSnapshot),
    Error { message: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Running,
    Complete,
    Failed,
}

/// Current state for clients that poll instead of streaming.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub operation: &'static str,
    pub state: OperationState,
    pub progress: ProgressSnapshot,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is already running")]
pub struct AlreadyRunning(pub &'static str);

/// Admits at most one running operation.
#[derive(Default)]
pub struct OperationSlot(AtomicBool);

impl OperationSlot {
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct ProgressRelay {
    operation: &'static str,
    events: broadcast::Sender<ProgressEvent>,
    status: watch::Sender<OperationStatus>,
    slot: OperationSlot,
}

impl ProgressRelay {
    pub fn new(operation: &'static str) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(OperationStatus {
            operation,
            state: OperationState::Idle,
            progress: ProgressSnapshot::default(),
            error: None,
        });
        Arc::new(Self {
            operation,
            events,
            status,
            slot: OperationSlot::default(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> OperationStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_busy()
    }

    /// The final event of the last finished operation, for clients that
    /// connect after it ended. Nothing earlier is replayed.
    pub fn terminal_event(&self) -> Option<ProgressEvent> {
        let status = self.status.borrow();
        match status.state {
            OperationState::Complete => Some(ProgressEvent::Complete(status.progress.clone())),
            OperationState::Failed => Some(ProgressEvent::Error {
                message: status.error.clone().unwrap_or_default(),
            }),
            OperationState::Idle | OperationState::Running => None,
        }
    }

    /// Claim the relay for a new operation.
    pub fn begin(self: &Arc<Self>) -> Result<ProgressReporter, AlreadyRunning> {
        if !self.slot.try_acquire() {
            return Err(AlreadyRunning(self.operation));
        }
        self.status.send_replace(OperationStatus {
            operation: self.operation,
            state: OperationState::Running,
            progress: ProgressSnapshot::default(),
            error: None,
        });
        tracing::info!("Started {}", self.operation);
        Ok(ProgressReporter {
            relay: self.clone(),
            snapshot: ProgressSnapshot::default(),
            started: Instant::now(),
            last_emit: None,
            finished: false,
        })
    }

    /// Publishes a terminal status without releasing the slot, the state a
    /// reporter is in between its last event and its release.
    #[cfg(test)]
    pub(crate) fn emit_for_test(&self, event: ProgressEvent) {
        self.emit(event);
    }

    fn emit(&self, event: ProgressEvent) {
        self.status.send_modify(|status| match &event {
            ProgressEvent::Progress(snapshot) => status.progress = snapshot.clone(),
            ProgressEvent::Complete(snapshot) => {
                status.state = OperationState::Complete;
                status.progress = snapshot.clone();
            }
            ProgressEvent::Error { message } => {
                status.state = OperationState::Failed;
                status.error = Some(message.clone());
            }
        });
        let _ = self.events.send(event);
    }
}

/// Producer handle for one operation. Counters only move forward and
/// exactly one terminal event is emitted, even if the reporter is dropped.
pub struct ProgressReporter {
    relay: Arc<ProgressRelay>,
    snapshot: ProgressSnapshot,
    started: Instant,
    last_emit: Option<(Instant, f64)>,
    finished: bool,
}

impl ProgressReporter {
    pub fn set_totals(&mut self, files_total: Option<u64>, bytes_total: Option<u64>) {
        self.snapshot.files_total = files_total;
        self.snapshot.bytes_total = bytes_total.filter(|t| *t > 0);
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.set_bytes(self.snapshot.bytes_done.saturating_add(n));
    }

    pub fn set_bytes(&mut self, done: u64) {
        self.snapshot.bytes_done = self.snapshot.bytes_done.max(done);
        self.maybe_emit();
    }

    pub fn set_files(&mut self, done: u64, current_file: Option<String>) {
        self.snapshot.files_done = self.snapshot.files_done.max(done);
        if current_file.is_some() {
            self.snapshot.current_file = current_file;
        }
        self.maybe_emit();
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    pub fn complete(mut self) -> ProgressSnapshot {
        if let Some(total) = self.snapshot.bytes_total {
            self.snapshot.bytes_done = self.snapshot.bytes_done.max(total);
        }
        if let Some(total) = self.snapshot.files_total {
            self.snapshot.files_done = self.snapshot.files_done.max(total);
        }
        self.refresh_rates();
        self.snapshot.percent = 100.0;
        self.snapshot.estimated_seconds = Some(0);

        let summary = self.snapshot.clone();
        self.finish(ProgressEvent::Complete(summary.clone()));
        tracing::info!("Finished {}", self.relay.operation);
        summary
    }

    pub fn fail(mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{} failed: {}", self.relay.operation, message);
        self.finish(ProgressEvent::Error { message });
    }

    fn finish(&mut self, event: ProgressEvent) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.relay.emit(event);
        self.relay.slot.release();
    }

    fn computed_percent(&self) -> f64 {
        let s = &self.snapshot;
        let fraction = match (s.bytes_total, s.files_total) {
            (Some(total), _) => s.bytes_done as f64 / total as f64,
            (None, Some(total)) if total > 0 => s.files_done as f64 / total as f64,
            _ => 0.0,
        };
        (fraction * 100.0).clamp(0.0, 100.0)
    }

    fn refresh_rates(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.snapshot.bytes_per_second = self.snapshot.bytes_done as f64 / elapsed;
        }
        self.snapshot.estimated_seconds = match self.snapshot.bytes_total {
            Some(total) if self.snapshot.bytes_per_second > 0.0 => {
                let remaining = total.saturating_sub(self.snapshot.bytes_done) as f64;
                Some((remaining / self.snapshot.bytes_per_second).ceil() as u64)
            }
            _ => None,
        };
    }

    fn maybe_emit(&mut self) {
        self.snapshot.percent = self.snapshot.percent.max(self.computed_percent());
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some((at, percent)) => {
                self.snapshot.percent - percent >= EMIT_PERCENT_STEP || now.duration_since(at) >= EMIT_INTERVAL
            }
        };
        if !due {
            return;
        }
        self.refresh_rates();
        self.last_emit = Some((now, self.snapshot.percent));
        self.relay.emit(ProgressEvent::Progress(self.snapshot.clone()));
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(ProgressEvent::Error {
                message: "operation aborted".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn byte_progress_is_monotonic_and_ends_once() {
        let relay = ProgressRelay::new("download");
        let mut rx = relay.subscribe();

        let mut reporter = relay.begin().unwrap();
        reporter.set_totals(None, Some(1000));
        for _ in 0..4 {
            reporter.add_bytes(250);
        }
        reporter.complete();

        let events = drain(&mut rx);
        let mut last_bytes = 0;
        let mut last_percent = 0.0;
        for event in &events {
            if let ProgressEvent::Progress(s) | ProgressEvent::Complete(s) = event {
                assert!(s.bytes_done >= last_bytes);
                assert!(s.percent >= last_percent);
                last_bytes = s.bytes_done;
                last_percent = s.percent;
            }
        }

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        match events.last() {
            Some(ProgressEvent::Complete(s)) => {
                assert_eq!(s.percent, 100.0);
                assert_eq!(s.bytes_done, 1000);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        assert_eq!(relay.status().state, OperationState::Complete);
        assert!(!relay.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn small_steps_are_throttled() {
        let relay = ProgressRelay::new("extraction");
        let mut rx = relay.subscribe();
        let mut reporter = relay.begin().unwrap();
        reporter.set_totals(Some(10_000), None);

        for done in 1..=50 {
            reporter.set_files(done, None);
        }
        // 50 of 10000 files is half a percent; only the first update goes out.
        assert_eq!(drain(&mut rx).len(), 1);

        tokio::time::advance(Duration::from_millis(300)).await;
        reporter.set_files(51, Some("assets/a.bin".into()));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(relay.status().progress.current_file.as_deref(), Some("assets/a.bin"));

        // Counters never move backwards.
        reporter.set_files(10, None);
        assert_eq!(reporter.snapshot().files_done, 51);
        reporter.fail("disk full");
    }

    #[tokio::test]
    async fn second_operation_is_refused_while_running() {
        let relay = ProgressRelay::new("download");
        let reporter = relay.begin().unwrap();
        assert!(relay.begin().is_err());

        reporter.fail("network down");
        assert_eq!(
            relay.terminal_event(),
            Some(ProgressEvent::Error {
                message: "network down".into()
            })
        );

        let again = relay.begin().unwrap();
        assert_eq!(relay.status().state, OperationState::Running);
        assert_eq!(relay.terminal_event(), None);
        again.complete();
    }

    #[tokio::test]
    async fn dropped_reporter_emits_error() {
        let relay = ProgressRelay::new("extraction");
        let mut rx = relay.subscribe();
        drop(relay.begin().unwrap());

        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::Error {
                message: "operation aborted".into()
            }
        );
        assert!(!relay.is_running());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::Complete(ProgressSnapshot {
            percent: 100.0,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["percent"], 100.0);
        assert!(json.get("bytesPerSecond").is_some());
    }
}
