//! Shared value types for the worldswap crates.
//!
//! Everything here is plain data: identifiers, spatial types and the small
//! deterministic RNG used by rotation. No crate-level state.

mod region;
mod rng;
mod types;

pub use region::{BlockPos, Region};
pub use rng::SplitMix64;
pub use types::{BlockId, EntityId, EntityKind, EnvironmentId, Transform};
