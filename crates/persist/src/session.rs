use serde::{Deserialize, Serialize};
use worldswap_common::EnvironmentId;

/// Swap state that normally lives only as long as the process.
///
/// Saved by hosts that want rotation and rollback to survive a restart;
/// restore it before the rotation scheduler starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub current: Option<EnvironmentId>,
    /// Rollback history, oldest first.
    #[serde(default)]
    pub history: Vec<EnvironmentId>,
    /// Index of the last environment chosen by sequential rotation (-1 before the first).
    #[serde(default = "initial_cursor")]
    pub rotation_cursor: i64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current: None,
            history: Vec::new(),
            rotation_cursor: initial_cursor(),
        }
    }
}

fn initial_cursor() -> i64 {
    -1
}
