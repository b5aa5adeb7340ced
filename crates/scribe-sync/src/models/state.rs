//! Published sync session state

use serde::{Deserialize, Serialize};

use crate::models::conflict::SyncConflict;

/// Top-level status of the sync session state machine.
///
/// Outstanding conflicts are not a blocking state: the status returns to
/// `Idle` once a pass completes even when `conflicts` is non-empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

/// Snapshot of the sync session published to subscribers after each
/// completed or failed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Current state machine position
    pub status: SyncStatus,
    /// Current conflicts, unresolved and recently resolved, in registry order
    pub conflicts: Vec<SyncConflict>,
    /// Advisory progress, 0-100, items processed over total in the pass
    pub progress: u8,
    /// Timestamp of the last completed pass (Unix ms), success or
    /// partial-success with conflicts
    pub last_sync: Option<i64>,
    /// Message from the last failed pass, cleared on the next success
    pub last_error: Option<String>,
}
