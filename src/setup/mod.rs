// Setup wizard state machine

pub mod payload;
pub mod sequencer;
pub mod session;
pub mod steps;
pub mod store;

pub use payload::{CheckSummary, RuntimeFacts, StepPayload, ValidationError, ValidationRules};
pub use sequencer::{SetupCompleted, SetupError, StepSaved, StepSequencer};
pub use session::{SessionId, SetupSession, SetupStatus};
pub use steps::StepId;
pub use store::{FileSessionStore, SessionStore, StoreError};
