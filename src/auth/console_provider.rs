// Game server device login driven through the server console

use super::{AuthDomain, Credentials, DeviceCodeProvider, DeviceGrant, PollOutcome, ProviderError};
use crate::console::classify::{is_auth_failure, is_auth_success, strip_ansi};
use crate::console::{ConsoleBridge, ConsoleEvent, ServerConsole};
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_EXPIRES_IN: u64 = 900;
const CONSOLE_POLL_INTERVAL: u64 = 2;

lazy_static! {
    static ref URL_RE: Regex = Regex::new(r#"https?://[^\s"'<>]+"#).expect("valid url regex");
    static ref CODE_RE: Regex =
        Regex::new(r"(?:[Cc]ode|CODE)\s*[:=]\s*([A-Z0-9]{4,}(?:-[A-Z0-9]{4,})*)").expect("valid code regex");
    static ref EXPIRES_RE: Regex =
        Regex::new(r"(?i)expires?\s+in\s+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m)\b").expect("valid expiry regex");
}

/// Pieces of a device login prompt collected across console lines.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LoginPrompt {
    verification_url: Option<String>,
    verification_url_direct: Option<String>,
    user_code: Option<String>,
    expires_in: Option<u64>,
}

impl LoginPrompt {
    fn absorb(&mut self, line: &str) {
        for m in URL_RE.find_iter(line) {
            let url = m.as_str().trim_end_matches(['.', ',', ')']);
            if url.contains("user_code=") {
                self.verification_url_direct.get_or_insert_with(|| url.to_string());
                if self.verification_url.is_none() {
                    let base = url.split('?').next().unwrap_or(url);
                    self.verification_url = Some(base.to_string());
                }
            } else {
                self.verification_url = Some(url.to_string());
            }
        }
        if let Some(caps) = CODE_RE.captures(line) {
            self.user_code = Some(caps[1].to_string());
        }
        if let Some(caps) = EXPIRES_RE.captures(line) {
            if let Ok(n) = caps[1].parse::<u64>() {
                let minutes = caps[2].to_ascii_lowercase().starts_with('m');
                self.expires_in = Some(if minutes { n * 60 } else { n });
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.verification_url.is_some() && self.user_code.is_some()
    }
}

/// The one login the server console can be running at a time.
struct LoginAttempt {
    device_code: String,
    outcome: Option<PollOutcome>,
    watcher: Option<JoinHandle<()>>,
}

type CurrentAttempt = Arc<Mutex<Option<LoginAttempt>>>;

/// Device login for the game server's own identity. The server prints the
/// prompt and the outcome to its console; this provider scrapes both.
pub struct ConsoleDeviceCodeProvider {
    console: Arc<dyn ServerConsole>,
    bridge: Arc<ConsoleBridge>,
    login_command: String,
    grant_timeout: Duration,
    current: CurrentAttempt,
}

impl ConsoleDeviceCodeProvider {
    pub fn new(
        console: Arc<dyn ServerConsole>,
        bridge: Arc<ConsoleBridge>,
        login_command: impl Into<String>,
        grant_timeout: Duration,
    ) -> Self {
        Self {
            console,
            bridge,
            login_command: login_command.into(),
            grant_timeout,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn authorized() -> PollOutcome {
        PollOutcome::Authorized(Credentials {
            domain: AuthDomain::Server,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            obtained_at: Utc::now(),
        })
    }
}

#[async_trait]
impl DeviceCodeProvider for ConsoleDeviceCodeProvider {
    async fn request_grant(&self) -> Result<DeviceGrant, ProviderError> {
        if let Some(previous) = self.current.lock().await.take() {
            if let Some(watcher) = previous.watcher {
                watcher.abort();
            }
        }

        // Subscribe first so the prompt cannot be missed.
        let mut events = self.bridge.subscribe();
        self.console
            .send_command(&self.login_command)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        tracing::info!("Sent server device login command");

        let device_code = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.grant_timeout;
        let mut prompt = LoginPrompt::default();
        let mut already_authorized = false;

        while !prompt.is_complete() {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::debug!("Login prompt reader skipped {} lines", skipped);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(ProviderError::Transport("console closed".to_string()));
                }
                Err(_) => {
                    return Err(ProviderError::Transport(
                        "server did not print a device code in time".to_string(),
                    ));
                }
            };
            let line = strip_ansi(&event.line.message);
            if is_auth_failure(&line) {
                return Err(ProviderError::Rejected(line));
            }
            if is_auth_success(&line) {
                already_authorized = true;
                break;
            }
            prompt.absorb(&line);
        }

        let expires_in = prompt.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        *self.current.lock().await = Some(LoginAttempt {
            device_code: device_code.clone(),
            outcome: already_authorized.then(Self::authorized),
            watcher: None,
        });
        if !already_authorized {
            let watcher = tokio::spawn(watch_login_outcome(
                events,
                self.current.clone(),
                device_code.clone(),
                Duration::from_secs(expires_in),
            ));
            match self.current.lock().await.as_mut() {
                Some(attempt) if attempt.device_code == device_code => attempt.watcher = Some(watcher),
                _ => watcher.abort(),
            }
        }

        Ok(DeviceGrant {
            device_code,
            user_code: prompt.user_code.unwrap_or_default(),
            verification_url: prompt.verification_url.unwrap_or_default(),
            verification_url_direct: prompt.verification_url_direct,
            expires_in,
            poll_interval_seconds: CONSOLE_POLL_INTERVAL,
        })
    }

    /// A settled outcome is handed out once and then forgotten. A grant that
    /// is no longer the current attempt reads as expired.
    async fn poll(&self, grant: &DeviceGrant) -> Result<PollOutcome, ProviderError> {
        let mut current = self.current.lock().await;
        let settled = match current.as_ref() {
            Some(attempt) if attempt.device_code == grant.device_code => attempt.outcome.clone(),
            _ => return Ok(PollOutcome::Expired),
        };
        match settled {
            Some(outcome) => {
                *current = None;
                Ok(outcome)
            }
            None => Ok(PollOutcome::Pending),
        }
    }
}

async fn watch_login_outcome(
    mut events: broadcast::Receiver<ConsoleEvent>,
    current: CurrentAttempt,
    device_code: String,
    lifetime: Duration,
) {
    let deadline = Instant::now() + lifetime;
    let outcome = loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => {
                let line = strip_ansi(&event.line.message);
                if is_auth_success(&line) {
                    tracing::info!("Server reported successful authentication");
                    break ConsoleDeviceCodeProvider::authorized();
                }
                if is_auth_failure(&line) {
                    tracing::warn!("Server reported authentication failure: {}", line);
                    break PollOutcome::Denied(line);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return,
            Err(_) => break PollOutcome::Expired,
        }
    };
    match current.lock().await.as_mut() {
        Some(attempt) if attempt.device_code == device_code => attempt.outcome = Some(outcome),
        _ => tracing::debug!("Login outcome for a superseded attempt dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::source::LineStream;
    use crate::console::{ConsoleError, LayeredClassifier, LogSource, ReconnectPolicy};
    use futures_util::stream::{self, StreamExt};
    use tokio::sync::mpsc;

    struct ChannelSource {
        rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    }

    #[async_trait]
    impl LogSource for ChannelSource {
        async fn follow(&self, _since: Option<i64>) -> Result<LineStream, ConsoleError> {
            match self.rx.lock().unwrap().take() {
                Some(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|line| (Ok(line), rx))
                })
                .boxed()),
                None => Err(ConsoleError::Unavailable("gone".into())),
            }
        }

        async fn tail(&self, _lines: usize) -> Result<Vec<String>, ConsoleError> {
            Ok(Vec::new())
        }
    }

    /// Answers the login command with a scripted prompt.
    struct ScriptedConsole {
        tx: mpsc::UnboundedSender<String>,
        prompt: Vec<&'static str>,
        commands: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServerConsole for ScriptedConsole {
        async fn send_command(&self, command: &str) -> Result<(), ConsoleError> {
            self.commands.lock().unwrap().push(command.to_string());
            for line in &self.prompt {
                let _ = self.tx.send(line.to_string());
            }
            Ok(())
        }
    }

    async fn setup(
        prompt: Vec<&'static str>,
    ) -> (ConsoleDeviceCodeProvider, mpsc::UnboundedSender<String>, Arc<ScriptedConsole>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(ConsoleBridge::new(
            Arc::new(LayeredClassifier::default()),
            ReconnectPolicy::default(),
        ));
        bridge
            .attach(Arc::new(ChannelSource {
                rx: std::sync::Mutex::new(Some(rx)),
            }))
            .await;
        let console = Arc::new(ScriptedConsole {
            tx: tx.clone(),
            prompt,
            commands: std::sync::Mutex::new(Vec::new()),
        });
        let provider = ConsoleDeviceCodeProvider::new(
            console.clone(),
            bridge,
            "/auth login device",
            Duration::from_secs(5),
        );
        (provider, tx, console)
    }

    async fn wait_for_outcome(provider: &ConsoleDeviceCodeProvider, grant: &DeviceGrant) -> PollOutcome {
        for _ in 0..200 {
            match provider.poll(grant).await.unwrap() {
                PollOutcome::Pending => tokio::time::sleep(Duration::from_millis(10)).await,
                other => return other,
            }
        }
        PollOutcome::Pending
    }

    #[test]
    fn prompt_lines_are_scraped() {
        let mut prompt = LoginPrompt::default();
        prompt.absorb("Visit https://oauth.example.com/device?user_code=ABCD-1234 to log in.");
        prompt.absorb("Enter code: ABCD-1234");
        prompt.absorb("The code expires in 10 minutes");

        assert_eq!(prompt.verification_url.as_deref(), Some("https://oauth.example.com/device"));
        assert_eq!(
            prompt.verification_url_direct.as_deref(),
            Some("https://oauth.example.com/device?user_code=ABCD-1234")
        );
        assert_eq!(prompt.user_code.as_deref(), Some("ABCD-1234"));
        assert_eq!(prompt.expires_in, Some(600));
        assert!(prompt.is_complete());
    }

    #[tokio::test]
    async fn login_prompt_becomes_a_grant_and_success_authorizes_it() {
        let (provider, tx, console) = setup(vec![
            "Starting device authorization",
            "Visit https://oauth.example.com/device to authorize",
            "Authorization code: WXYZ-9876",
            "Code expires in 300 seconds",
        ])
        .await;

        let grant = provider.request_grant().await.unwrap();
        assert_eq!(console.commands.lock().unwrap().as_slice(), ["/auth login device"]);
        assert_eq!(grant.user_code, "WXYZ-9876");
        assert_eq!(grant.verification_url, "https://oauth.example.com/device");
        assert_eq!(grant.expires_in, 300);
        assert_eq!(provider.poll(&grant).await.unwrap(), PollOutcome::Pending);

        tx.send("Authentication successful!".to_string()).unwrap();
        match wait_for_outcome(&provider, &grant).await {
            PollOutcome::Authorized(credentials) => assert_eq!(credentials.domain, AuthDomain::Server),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn settled_and_superseded_attempts_are_forgotten() {
        let (provider, tx, _console) = setup(vec![
            "Visit https://oauth.example.com/device to authorize",
            "Authorization code: WXYZ-9876",
        ])
        .await;

        let first = provider.request_grant().await.unwrap();
        let second = provider.request_grant().await.unwrap();
        assert_ne!(first.device_code, second.device_code);
        assert_eq!(provider.poll(&first).await.unwrap(), PollOutcome::Expired);
        assert_eq!(provider.poll(&second).await.unwrap(), PollOutcome::Pending);

        tx.send("Authentication successful!".to_string()).unwrap();
        assert!(matches!(
            wait_for_outcome(&provider, &second).await,
            PollOutcome::Authorized(_)
        ));
        assert!(provider.current.lock().await.is_none());
    }

    #[tokio::test]
    async fn failure_line_denies_the_grant() {
        let (provider, tx, _console) = setup(vec![
            "Visit https://oauth.example.com/device?user_code=QQQQ-1111",
            "code: QQQQ-1111",
        ])
        .await;

        let grant = provider.request_grant().await.unwrap();
        assert_eq!(grant.expires_in, DEFAULT_EXPIRES_IN);

        tx.send("Authentication failed: authorization denied".to_string()).unwrap();
        assert!(matches!(
            wait_for_outcome(&provider, &grant).await,
            PollOutcome::Denied(_)
        ));
    }
}
