// Console line classification

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ANSI_RE: Regex =
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\r")
            .expect("valid ansi regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log,
    AuthRequired,
    Started,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LineLevel,
}

/// One classified console line as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub kind: EventKind,
    #[serde(flatten)]
    pub line: ConsoleLine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: EventKind,
    pub level: LineLevel,
    pub message: String,
}

impl Classification {
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Log,
            level: LineLevel::Info,
            message: message.into(),
        }
    }

    pub fn into_event(self) -> ConsoleEvent {
        ConsoleEvent {
            kind: self.kind,
            line: ConsoleLine {
                timestamp: Utc::now(),
                message: self.message,
                level: self.level,
            },
        }
    }
}

pub trait LineClassifier: Send + Sync {
    /// Classify a raw line, or `None` when this classifier does not recognize its shape.
    fn classify(&self, raw: &str) -> Option<Classification>;
}

/// Server builds that emit JSON log lines:
/// `{"event": "started", "message": "...", "level": "info"}`.
pub struct StructuredClassifier;

#[derive(Deserialize)]
struct StructuredLine {
    event: Option<String>,
    message: Option<String>,
    level: Option<String>,
}

impl LineClassifier for StructuredClassifier {
    fn classify(&self, raw: &str) -> Option<Classification> {
        let trimmed = strip_ansi(raw);
        let trimmed = trimmed.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let parsed: StructuredLine = serde_json::from_str(trimmed).ok()?;
        if parsed.event.is_none() && parsed.message.is_none() {
            return None;
        }

        let kind = match parsed.event.as_deref() {
            Some("started" | "server_started" | "booted") => EventKind::Started,
            Some("auth_required") => EventKind::AuthRequired,
            Some("error") => EventKind::Error,
            _ => EventKind::Log,
        };
        let level = match (kind, parsed.level.as_deref()) {
            (EventKind::Error, _) => LineLevel::Error,
            (_, Some("error" | "severe" | "fatal")) => LineLevel::Error,
            (_, Some("warn" | "warning")) => LineLevel::Warning,
            (EventKind::AuthRequired, _) => LineLevel::Warning,
            _ => LineLevel::Info,
        };

        Some(Classification {
            kind,
            level,
            message: parsed.message.unwrap_or_default(),
        })
    }
}

/// Plain-text substring heuristics for servers without structured logging.
pub struct HeuristicClassifier;

impl LineClassifier for HeuristicClassifier {
    fn classify(&self, raw: &str) -> Option<Classification> {
        let message = strip_ansi(raw).trim_end().to_string();
        let lower = message.to_lowercase();

        let (kind, level) = if lower.contains("server booted") || lower.contains("server started") {
            (EventKind::Started, LineLevel::Info)
        } else if lower.contains("authentication required")
            || lower.contains("no server tokens configured")
        {
            (EventKind::AuthRequired, LineLevel::Warning)
        } else if ["severe", "error", "exception", "fatal"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            (EventKind::Error, LineLevel::Error)
        } else if lower.contains("warn") {
            (EventKind::Log, LineLevel::Warning)
        } else {
            (EventKind::Log, LineLevel::Info)
        };

        Some(Classification { kind, level, message })
    }
}

/// Tries each layer in order; the first that recognizes the line wins.
pub struct LayeredClassifier {
    layers: Vec<Box<dyn LineClassifier>>,
}

impl LayeredClassifier {
    pub fn new(layers: Vec<Box<dyn LineClassifier>>) -> Self {
        Self { layers }
    }
}

impl Default for LayeredClassifier {
    fn default() -> Self {
        Self::new(vec![Box::new(StructuredClassifier), Box::new(HeuristicClassifier)])
    }
}

impl LineClassifier for LayeredClassifier {
    fn classify(&self, raw: &str) -> Option<Classification> {
        self.layers.iter().find_map(|layer| layer.classify(raw))
    }
}

/// Boot state derived from console output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootFlags {
    pub booted: bool,
    pub auth_required: bool,
    pub last_error: Option<String>,
}

impl BootFlags {
    /// Fold one line into the flags. Returns true when anything changed.
    pub fn apply(&mut self, classification: &Classification) -> bool {
        let before = self.clone();
        match classification.kind {
            EventKind::Started => self.booted = true,
            EventKind::AuthRequired => self.auth_required = true,
            EventKind::Error => self.last_error = Some(classification.message.clone()),
            EventKind::Log => {
                if is_auth_success(&classification.message) {
                    self.auth_required = false;
                }
            }
        }
        *self != before
    }
}

pub fn derive_flags(classifier: &dyn LineClassifier, lines: &[String]) -> BootFlags {
    let mut flags = BootFlags::default();
    for line in lines {
        let classification = classifier
            .classify(line)
            .unwrap_or_else(|| Classification::log(line.as_str()));
        flags.apply(&classification);
    }
    flags
}

pub fn is_auth_success(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("authentication successful")
        || lower.contains("successfully authenticated")
        || lower.contains("auth success")
}

pub fn is_auth_failure(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("authentication failed")
        || lower.contains("authorization denied")
        || lower.contains("device code expired")
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(line: &str) -> Classification {
        LayeredClassifier::default().classify(line).unwrap()
    }

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\x1b[32m[INFO]\x1b[0m ready\r"), "[INFO] ready");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
    }

    #[test]
    fn structured_lines_take_precedence() {
        let c = classify(r#"{"event":"started","message":"listening on 5520","level":"info"}"#);
        assert_eq!(c.kind, EventKind::Started);
        assert_eq!(c.message, "listening on 5520");

        // "error" in the message must not override the structured kind.
        let c = classify(r#"{"event":"log","message":"0 errors during load","level":"info"}"#);
        assert_eq!(c.kind, EventKind::Log);
        assert_eq!(c.level, LineLevel::Info);
    }

    #[test]
    fn heuristics_cover_plain_text_servers() {
        assert_eq!(classify("[Server] Hytale Server Booted!").kind, EventKind::Started);
        assert_eq!(
            classify("WARN No server tokens configured. Use /auth login device").kind,
            EventKind::AuthRequired
        );
        let c = classify("\x1b[31mSEVERE: Failed to bind port\x1b[0m");
        assert_eq!(c.kind, EventKind::Error);
        assert_eq!(c.message, "SEVERE: Failed to bind port");
        assert_eq!(classify("[WARN] slow tick").level, LineLevel::Warning);
        assert_eq!(classify("{not json").kind, EventKind::Log);
    }

    #[test]
    fn flags_follow_the_log() {
        let lines: Vec<String> = [
            "Loading world",
            "Authentication required for this server",
            "Authentication successful",
            "Hytale Server Booted",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let flags = derive_flags(&LayeredClassifier::default(), &lines);
        assert!(flags.booted);
        assert!(!flags.auth_required);
        assert_eq!(flags.last_error, None);
    }

    #[test]
    fn console_event_serializes_flat() {
        let event = Classification::log("hello").into_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "log");
        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "hello");
        assert!(json.get("timestamp").is_some());
    }
}
