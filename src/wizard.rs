// Client Wizard Projection - sub-step state machines embedded by a wizard UI
//
// Server state is canonical. Every flow re-derives its phase from a
// `ServerSnapshot` and only keeps local state for choices the server has
// not seen yet.

use crate::console::ConsoleEvent;
use crate::progress::OperationState;
use crate::setup::payload::DownloadMethod;
use crate::setup::{SetupStatus, StepId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const CONSOLE_BUFFER_CAPACITY: usize = 500;

/// Everything the flows need from the status endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub status: SetupStatus,
    pub downloader_authenticated: bool,
    pub download: OperationState,
    pub download_verified: bool,
    pub extraction: OperationState,
    pub extraction_complete: bool,
    pub server_booted: bool,
    pub server_authenticated: bool,
    pub persistence_enabled: bool,
}

impl ServerSnapshot {
    fn resolved(&self, step: StepId) -> bool {
        self.status.completed_steps.contains(&step) || self.status.skipped_steps.contains(&step)
    }
}

/// After `back()` the flow holds its position until the user acts again,
/// so a reconcile cannot push it forward behind their back.
fn settle<P: Ord + Copy>(local: P, derived: P, pinned: bool) -> P {
    if pinned {
        local.min(derived)
    } else {
        derived
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadPhase {
    Select,
    Auth,
    Downloading,
    Verifying,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFlow {
    phase: DownloadPhase,
    method: Option<DownloadMethod>,
    pinned: bool,
}

impl Default for DownloadFlow {
    fn default() -> Self {
        Self {
            phase: DownloadPhase::Select,
            method: None,
            pinned: false,
        }
    }
}

impl DownloadFlow {
    pub fn phase(&self) -> DownloadPhase {
        self.phase
    }

    pub fn method(&self) -> Option<DownloadMethod> {
        self.method
    }

    pub fn choose(&mut self, method: DownloadMethod) {
        self.method = Some(method);
        self.pinned = false;
        self.phase = match method {
            DownloadMethod::Official => DownloadPhase::Auth,
            DownloadMethod::Manual => DownloadPhase::Complete,
        };
    }

    pub fn reconcile(&mut self, snapshot: &ServerSnapshot) -> DownloadPhase {
        let derived = if snapshot.resolved(StepId::DownloadMethod) || snapshot.download_verified {
            DownloadPhase::Complete
        } else if snapshot.download == OperationState::Running {
            DownloadPhase::Downloading
        } else if snapshot.download == OperationState::Complete {
            DownloadPhase::Verifying
        } else {
            match self.method {
                Some(DownloadMethod::Manual) => DownloadPhase::Complete,
                Some(DownloadMethod::Official) => DownloadPhase::Auth,
                None if snapshot.downloader_authenticated => DownloadPhase::Auth,
                None => DownloadPhase::Select,
            }
        };
        self.phase = settle(self.phase, derived, self.pinned);
        self.phase
    }

    /// Returns false when already at the first sub-state.
    pub fn back(&mut self) -> bool {
        let previous = match self.phase {
            DownloadPhase::Select => return false,
            DownloadPhase::Auth => DownloadPhase::Select,
            DownloadPhase::Downloading | DownloadPhase::Verifying => DownloadPhase::Auth,
            DownloadPhase::Complete => match self.method {
                Some(DownloadMethod::Manual) | None => DownloadPhase::Select,
                Some(DownloadMethod::Official) => DownloadPhase::Auth,
            },
        };
        self.phase = previous;
        self.pinned = true;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerAuthPhase {
    Starting,
    ServerAuth,
    Persistence,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuthFlow {
    phase: ServerAuthPhase,
    pinned: bool,
}

impl Default for ServerAuthFlow {
    fn default() -> Self {
        Self {
            phase: ServerAuthPhase::Starting,
            pinned: false,
        }
    }
}

impl ServerAuthFlow {
    pub fn phase(&self) -> ServerAuthPhase {
        self.phase
    }

    pub fn reconcile(&mut self, snapshot: &ServerSnapshot) -> ServerAuthPhase {
        let derived = if snapshot.resolved(StepId::ServerAuth)
            || (snapshot.server_authenticated && snapshot.persistence_enabled)
        {
            ServerAuthPhase::Complete
        } else if snapshot.server_authenticated {
            ServerAuthPhase::Persistence
        } else if snapshot.server_booted {
            ServerAuthPhase::ServerAuth
        } else {
            ServerAuthPhase::Starting
        };
        self.phase = settle(self.phase, derived, self.pinned);
        self.phase
    }

    /// Persistence is optional; the user may move on without it.
    pub fn skip_persistence(&mut self) {
        if self.phase == ServerAuthPhase::Persistence {
            self.phase = ServerAuthPhase::Complete;
            self.pinned = false;
        }
    }

    pub fn back(&mut self) -> bool {
        self.phase = match self.phase {
            ServerAuthPhase::Starting => return false,
            ServerAuthPhase::ServerAuth => ServerAuthPhase::Starting,
            ServerAuthPhase::Persistence => ServerAuthPhase::ServerAuth,
            ServerAuthPhase::Complete => ServerAuthPhase::Persistence,
        };
        self.pinned = true;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtractionPhase {
    Select,
    Extracting,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFlow {
    phase: ExtractionPhase,
    pinned: bool,
}

impl Default for ExtractionFlow {
    fn default() -> Self {
        Self {
            phase: ExtractionPhase::Select,
            pinned: false,
        }
    }
}

impl ExtractionFlow {
    pub fn phase(&self) -> ExtractionPhase {
        self.phase
    }

    pub fn reconcile(&mut self, snapshot: &ServerSnapshot) -> ExtractionPhase {
        let derived = if snapshot.resolved(StepId::Assets) || snapshot.extraction_complete {
            ExtractionPhase::Complete
        } else if snapshot.extraction == OperationState::Running {
            ExtractionPhase::Extracting
        } else {
            ExtractionPhase::Select
        };
        self.phase = settle(self.phase, derived, self.pinned);
        self.phase
    }

    pub fn back(&mut self) -> bool {
        self.phase = match self.phase {
            ExtractionPhase::Select => return false,
            ExtractionPhase::Extracting | ExtractionPhase::Complete => ExtractionPhase::Select,
        };
        self.pinned = true;
        true
    }
}

/// Local countdown for a device code. Purely cosmetic: expiry is only
/// ever decided by the server's auth status.
#[derive(Debug, Clone, Copy)]
pub struct CountdownEstimate {
    ends_at: Instant,
}

impl CountdownEstimate {
    pub fn new(expires_in_seconds: u64, now: Instant) -> Self {
        Self {
            ends_at: now + Duration::from_secs(expires_in_seconds),
        }
    }

    /// Re-anchor on a fresh server value.
    pub fn sync(&mut self, expires_in_seconds: u64, now: Instant) {
        *self = Self::new(expires_in_seconds, now);
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.ends_at.saturating_duration_since(now)
    }

    pub fn display(&self, now: Instant) -> String {
        let secs = self.remaining(now).as_secs();
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

/// Capped ring buffer of console lines.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: VecDeque<ConsoleEvent>,
    capacity: usize,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::with_capacity(CONSOLE_BUFFER_CAPACITY)
    }
}

impl ConsoleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: ConsoleEvent) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsoleEvent> {
        self.lines.iter()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Decides when an event stream has misbehaved enough that the client
/// should switch to polling the status endpoint.
#[derive(Debug, Clone)]
pub struct StreamFallback {
    max_errors: u32,
    stall_timeout: Duration,
    consecutive_errors: u32,
    last_activity: Instant,
}

impl StreamFallback {
    pub fn new(max_errors: u32, stall_timeout: Duration, now: Instant) -> Self {
        Self {
            max_errors,
            stall_timeout,
            consecutive_errors: 0,
            last_activity: now,
        }
    }

    pub fn on_event(&mut self, now: Instant) {
        self.consecutive_errors = 0;
        self.last_activity = now;
    }

    /// Record a stream error. Returns true once the client should poll.
    pub fn on_error(&mut self, now: Instant) -> bool {
        self.consecutive_errors += 1;
        self.should_poll(now)
    }

    pub fn should_poll(&self, now: Instant) -> bool {
        self.consecutive_errors >= self.max_errors
            || now.saturating_duration_since(self.last_activity) >= self.stall_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::classify::Classification;
    use crate::setup::steps::total_steps;

    fn snapshot() -> ServerSnapshot {
        ServerSnapshot {
            status: SetupStatus {
                setup_complete: false,
                current_step: 3,
                current_step_id: StepId::DownloadMethod,
                total_steps: total_steps(),
                completed_steps: vec![StepId::SystemCheck, StepId::Language, StepId::AdminAccount],
                skipped_steps: vec![],
            },
            downloader_authenticated: false,
            download: OperationState::Idle,
            download_verified: false,
            extraction: OperationState::Idle,
            extraction_complete: false,
            server_booted: false,
            server_authenticated: false,
            persistence_enabled: false,
        }
    }

    #[test]
    fn download_flow_follows_the_server() {
        let mut flow = DownloadFlow::default();
        let mut server = snapshot();
        assert_eq!(flow.reconcile(&server), DownloadPhase::Select);

        flow.choose(DownloadMethod::Official);
        assert_eq!(flow.reconcile(&server), DownloadPhase::Auth);

        server.download = OperationState::Running;
        assert_eq!(flow.reconcile(&server), DownloadPhase::Downloading);

        server.download = OperationState::Complete;
        assert_eq!(flow.reconcile(&server), DownloadPhase::Verifying);

        server.download_verified = true;
        assert_eq!(flow.reconcile(&server), DownloadPhase::Complete);
    }

    #[test]
    fn reload_mid_download_resumes_from_server_state() {
        let mut server = snapshot();
        server.download = OperationState::Running;

        let mut fresh = DownloadFlow::default();
        assert_eq!(fresh.reconcile(&server), DownloadPhase::Downloading);
    }

    #[test]
    fn local_state_is_not_canonical() {
        let mut flow = DownloadFlow::default();
        flow.choose(DownloadMethod::Official);
        let mut server = snapshot();
        server.download = OperationState::Running;
        flow.reconcile(&server);

        // The download failed while the page was open.
        server.download = OperationState::Failed;
        assert_eq!(flow.reconcile(&server), DownloadPhase::Auth);
    }

    #[test]
    fn back_holds_position_without_touching_the_server() {
        let mut server = snapshot();
        server.download_verified = true;
        let mut flow = DownloadFlow::default();
        flow.choose(DownloadMethod::Official);
        assert_eq!(flow.reconcile(&server), DownloadPhase::Complete);

        assert!(flow.back());
        assert_eq!(flow.phase(), DownloadPhase::Auth);
        assert_eq!(flow.reconcile(&server), DownloadPhase::Auth);
        assert!(flow.back());
        assert!(!flow.back());

        flow.choose(DownloadMethod::Official);
        assert_eq!(flow.reconcile(&server), DownloadPhase::Complete);
    }

    #[test]
    fn server_auth_flow_phases() {
        let mut flow = ServerAuthFlow::default();
        let mut server = snapshot();
        assert_eq!(flow.reconcile(&server), ServerAuthPhase::Starting);

        server.server_booted = true;
        assert_eq!(flow.reconcile(&server), ServerAuthPhase::ServerAuth);

        server.server_authenticated = true;
        assert_eq!(flow.reconcile(&server), ServerAuthPhase::Persistence);

        flow.skip_persistence();
        assert_eq!(flow.phase(), ServerAuthPhase::Complete);

        server.persistence_enabled = true;
        assert_eq!(flow.reconcile(&server), ServerAuthPhase::Complete);
    }

    #[test]
    fn extraction_flow_treats_a_skipped_step_as_complete() {
        let mut flow = ExtractionFlow::default();
        let mut server = snapshot();
        server.extraction = OperationState::Running;
        assert_eq!(flow.reconcile(&server), ExtractionPhase::Extracting);

        server.extraction = OperationState::Idle;
        server.status.skipped_steps.push(StepId::Assets);
        assert_eq!(flow.reconcile(&server), ExtractionPhase::Complete);
    }

    #[test]
    fn countdown_never_goes_negative() {
        let start = Instant::now();
        let mut countdown = CountdownEstimate::new(125, start);
        assert_eq!(countdown.display(start), "2:05");
        assert_eq!(countdown.remaining(start + Duration::from_secs(200)), Duration::ZERO);
        assert_eq!(countdown.display(start + Duration::from_secs(200)), "0:00");

        countdown.sync(60, start + Duration::from_secs(200));
        assert_eq!(countdown.display(start + Duration::from_secs(200)), "1:00");
    }

    #[test]
    fn console_buffer_drops_the_oldest_lines() {
        let mut buffer = ConsoleBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.push(Classification::log(format!("line {i}")).into_event());
        }
        let messages: Vec<_> = buffer.iter().map(|e| e.line.message.as_str()).collect();
        assert_eq!(messages, ["line 2", "line 3", "line 4"]);
        assert_eq!(ConsoleBuffer::default().capacity, CONSOLE_BUFFER_CAPACITY);
    }

    #[test]
    fn stream_falls_back_after_errors_or_silence() {
        let start = Instant::now();
        let mut fallback = StreamFallback::new(3, Duration::from_secs(30), start);
        assert!(!fallback.on_error(start));
        assert!(!fallback.on_error(start));
        fallback.on_event(start);
        assert!(!fallback.on_error(start));
        assert!(!fallback.on_error(start));
        assert!(fallback.on_error(start));

        let mut quiet = StreamFallback::new(3, Duration::from_secs(30), start);
        assert!(!quiet.should_poll(start + Duration::from_secs(29)));
        assert!(quiet.should_poll(start + Duration::from_secs(30)));
        quiet.on_event(start + Duration::from_secs(30));
        assert!(!quiet.should_poll(start + Duration::from_secs(31)));
    }
}
