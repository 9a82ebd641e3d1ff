//! World Kernel: the live, mutable world that environment swaps overwrite.
//!
//! # Invariants
//! - All state mutations flow through explicit operations.
//! - Every mutation appends a [`WorldEvent`]; a drained log summarises what changed.

pub mod world;

pub use world::{ChangeSummary, EntityData, World, WorldEvent};
