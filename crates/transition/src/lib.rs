//! Environment transitions: swap, preview, rotate and roll back the live world.
//!
//! # Invariants
//! - Every apply and undo passes through one [`MutationDomain`]; no two overlap.
//! - At most one transition is in flight; a second `begin` is rejected, never queued.
//! - The current environment changes only when a transition commits.
//! - Occupants are relocated before the first countdown tick, and the
//!   countdown finishes before the paste.
//! - Every applied preview is reverted exactly once, independent of its requester.
//! - Observer failures are logged and never reach the commit path.

mod config;
mod countdown;
mod domain;
mod error;
mod history;
mod host;
mod observers;
mod orchestrator;
mod preview;
mod rotation;
mod safety;

#[cfg(test)]
mod testing;

pub use config::{EnvironmentConfig, RotationConfig, SwapConfig};
pub use countdown::{Countdown, CountdownOutcome};
pub use domain::{AppliedHandle, MutationAuthority, MutationDomain};
pub use error::{
    ConfigError, MutationError, PreviewError, RotationError, TransitionError, ValidationError,
};
pub use history::HistoryStack;
pub use host::{BuildLimits, SpawnPlacer, WorldAuthority, WorldHost};
pub use observers::{CallbackRegistry, EnvironmentChange, Observer, ObserverError};
pub use orchestrator::{
    CommittedTransition, Orchestrator, TransitionEvent, TransitionSettings, TransitionState,
};
pub use preview::{DEFAULT_PREVIEW_DURATION, PreviewManager, PreviewTicket};
pub use rotation::{
    CycleOutcome, EnvironmentResolver, RotationMode, RotationScheduler, RotationSettings, VoteBox,
};
pub use safety::{NoopSafety, OccupancyProbe, SafetyCoordinator, SafetyReport};
