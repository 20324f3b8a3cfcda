// Process Console Bridge - single log follower fanned out to many subscribers

use super::classify::{derive_flags, BootFlags, Classification, ConsoleEvent, EventKind, LineClassifier, LineLevel};
use super::source::LogSource;
use chrono::Utc;
use futures_util::stream::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub tail_lines: usize,
    /// Degraded polling re-probes the live stream every this many polls.
    pub reprobe_every: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            poll_interval: Duration::from_secs(3),
            tail_lines: 200,
            reprobe_every: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Detached,
    Connected,
    Reconnecting { attempt: u32 },
    DegradedPolling,
}

struct LogStreamHandle {
    cancel_tx: watch::Sender<bool>,
}

struct Shared {
    classifier: Arc<dyn LineClassifier>,
    events: broadcast::Sender<ConsoleEvent>,
    flags: watch::Sender<BootFlags>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn publish(&self, raw: &str) {
        let classification = self
            .classifier
            .classify(raw)
            .unwrap_or_else(|| Classification::log(raw));
        self.flags.send_if_modified(|flags| flags.apply(&classification));
        // No subscribers is fine; the flags still track state.
        let _ = self.events.send(classification.into_event());
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!("Console connection: {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Replace the flags with ones re-derived from a polled tail and
    /// announce transitions that the live stream would have announced.
    fn absorb_polled(&self, polled: BootFlags) {
        let previous = self.flags.borrow().clone();
        if polled.booted && !previous.booted {
            self.synthesize(EventKind::Started, LineLevel::Info, "Server booted");
        }
        if polled.auth_required && !previous.auth_required {
            self.synthesize(EventKind::AuthRequired, LineLevel::Warning, "Server authentication required");
        }
        if polled.last_error.is_some() && polled.last_error != previous.last_error {
            let message = polled.last_error.clone().unwrap_or_default();
            self.synthesize(EventKind::Error, LineLevel::Error, &message);
        }
        self.flags.send_if_modified(|flags| {
            if *flags == polled {
                false
            } else {
                *flags = polled;
                true
            }
        });
    }

    fn synthesize(&self, kind: EventKind, level: LineLevel, message: &str) {
        let _ = self.events.send(
            Classification {
                kind,
                level,
                message: message.to_string(),
            }
            .into_event(),
        );
    }
}

/// Follows one log source at a time and relays classified lines.
pub struct ConsoleBridge {
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    handle: Mutex<Option<LogStreamHandle>>,
}

impl ConsoleBridge {
    pub fn new(classifier: Arc<dyn LineClassifier>, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(512);
        let (flags, _) = watch::channel(BootFlags::default());
        let (state, _) = watch::channel(ConnectionState::Detached);
        Self {
            shared: Arc::new(Shared {
                classifier,
                events,
                flags,
                state,
            }),
            policy,
            handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.shared.events.subscribe()
    }

    pub fn flags(&self) -> BootFlags {
        self.shared.flags.borrow().clone()
    }

    pub fn watch_flags(&self) -> watch::Receiver<BootFlags> {
        self.shared.flags.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn classifier(&self) -> Arc<dyn LineClassifier> {
        self.shared.classifier.clone()
    }

    /// Start following `source`, replacing any previous follower. Flags
    /// start over because they describe the new process run.
    pub async fn attach(&self, source: Arc<dyn LogSource>) {
        let mut handle = self.handle.lock().await;
        if let Some(previous) = handle.take() {
            let _ = previous.cancel_tx.send(true);
        }
        self.shared.flags.send_replace(BootFlags::default());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *handle = Some(LogStreamHandle { cancel_tx });

        let shared = self.shared.clone();
        let policy = self.policy.clone();
        tokio::spawn(async move {
            stream_console_loop(source, shared, policy, cancel_rx).await;
        });
        tracing::info!("Console bridge attached");
    }

    pub async fn detach(&self) {
        if let Some(previous) = self.handle.lock().await.take() {
            let _ = previous.cancel_tx.send(true);
            self.shared.set_state(ConnectionState::Detached);
            tracing::info!("Console bridge detached");
        }
    }
}

async fn stream_console_loop(
    source: Arc<dyn LogSource>,
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut last_seen: Option<i64> = None;

    loop {
        if *cancel_rx.borrow() {
            return;
        }

        match source.follow(last_seen).await {
            Ok(mut lines) => {
                shared.set_state(ConnectionState::Connected);
                loop {
                    tokio::select! {
                        biased;

                        changed = cancel_rx.changed() => {
                            if changed.is_err() || *cancel_rx.borrow() {
                                return;
                            }
                        }

                        next = lines.next() => {
                            match next {
                                Some(Ok(line)) => {
                                    attempt = 0;
                                    last_seen = Some(Utc::now().timestamp());
                                    shared.publish(&line);
                                }
                                Some(Err(e)) => {
                                    tracing::warn!("Console stream error: {}", e);
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Console stream connect failed: {}", e);
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            tracing::warn!(
                "Console stream unavailable after {} attempts, falling back to polling",
                policy.max_attempts
            );
            if !poll_degraded(&source, &shared, &policy, &mut cancel_rx).await {
                return;
            }
            attempt = 0;
            continue;
        }

        shared.set_state(ConnectionState::Reconnecting { attempt });
        if !sleep_or_cancel(policy.delay(attempt), &mut cancel_rx).await {
            return;
        }
    }
}

/// Poll the tail until it is time to re-probe the live stream.
/// Returns false when cancelled.
async fn poll_degraded(
    source: &Arc<dyn LogSource>,
    shared: &Shared,
    policy: &ReconnectPolicy,
    cancel_rx: &mut watch::Receiver<bool>,
) -> bool {
    shared.set_state(ConnectionState::DegradedPolling);
    let mut polls: u32 = 0;

    loop {
        match source.tail(policy.tail_lines).await {
            Ok(lines) => {
                let polled = derive_flags(shared.classifier.as_ref(), &lines);
                shared.absorb_polled(polled);
            }
            Err(e) => {
                tracing::debug!("Console tail poll failed: {}", e);
            }
        }

        polls += 1;
        if polls >= policy.reprobe_every.max(1) {
            tracing::debug!("Re-probing console stream");
            return true;
        }

        if !sleep_or_cancel(policy.poll_interval, cancel_rx).await {
            return false;
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;

        changed = cancel_rx.changed() => changed.is_ok() && !*cancel_rx.borrow(),
        _ = tokio::time::sleep(duration) => true,
    }
}
