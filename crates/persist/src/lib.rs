//! Persistence: decoded environment snapshots and where they come from.
//!
//! # Invariants
//! - Snapshots are immutable once decoded and carry a verifiable content hash.
//! - On-disk files are checked against a SHA-256 manifest; mismatches fail closed.
//! - Insertion order of environments is preserved by every store.

mod session;
mod snapshot;
mod store;

pub use session::SessionState;
pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotSource};
pub use store::{IntegrityManifest, LibraryMeta, ManifestEntry, SnapshotLibrary};

use worldswap_common::EnvironmentId;

/// Errors from snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("no snapshot stored for environment '{0}'")]
    NotFound(EnvironmentId),
    #[error("environment id '{0}' cannot be used as a snapshot name")]
    InvalidId(EnvironmentId),
}
