// Game server console: log following, classification and command input

pub mod bridge;
pub mod classify;
pub mod source;

pub use bridge::{ConnectionState, ConsoleBridge, ReconnectPolicy};
pub use classify::{BootFlags, ConsoleEvent, EventKind, LayeredClassifier, LineClassifier, LineLevel};
pub use source::{ConsoleError, DockerConsole, DockerLogSource, LogSource, ServerConsole};
