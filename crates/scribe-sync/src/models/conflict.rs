//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::item::{ItemFields, ItemId, ItemKind, RevisionedItem};

/// A unique identifier for a conflict, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Create a new unique conflict ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Why a divergence could not be resolved automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    /// Both sides changed since the common base
    ConcurrentEdit,
    /// Both sides edited free-text content; never auto-merged
    ContentDivergence,
    /// One side tombstoned the item, the other edited it
    DeleteVsEdit,
    /// The item's payload failed structural validation
    MalformedItem,
}

/// A divergence that requires a decision, with both full snapshots
/// attached as they looked at detection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Unique conflict identifier, stable while the divergence is live
    pub id: ConflictId,
    /// Kind of the contended item
    pub item_kind: ItemKind,
    /// Id of the contended item
    pub item_id: ItemId,
    /// Local snapshot at detection time; `None` only for one-sided
    /// malformed-item conflicts
    pub local_version: Option<RevisionedItem>,
    /// Remote snapshot at detection time; `None` only for one-sided
    /// malformed-item conflicts
    pub remote_version: Option<RevisionedItem>,
    /// Why automatic resolution was not safe
    pub reason: ConflictReason,
    /// Detection timestamp (Unix ms); bumped when a later pass supersedes
    /// the snapshots
    pub detected_at: i64,
    /// Whether a resolution has been applied
    pub resolved: bool,
    /// The resolved item, set once resolved
    pub resolved_item: Option<RevisionedItem>,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    /// Create an unresolved conflict over the given snapshots.
    ///
    /// At least one snapshot must be present; callers guarantee this by
    /// construction (the pairing step never yields two absent sides).
    #[must_use]
    pub fn new(
        item_kind: ItemKind,
        item_id: ItemId,
        local_version: Option<RevisionedItem>,
        remote_version: Option<RevisionedItem>,
        reason: ConflictReason,
        detected_at: i64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            item_kind,
            item_id,
            local_version,
            remote_version,
            reason,
            detected_at,
            resolved: false,
            resolved_item: None,
            resolved_at: None,
        }
    }
}

/// Strategy for resolving a single conflict manually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep the local snapshot
    LocalWins,
    /// Keep the remote snapshot
    RemoteWins,
    /// Field-level merge (tags unioned, scalars last-writer-wins);
    /// fails if free-text content diverged
    Merge,
    /// Use the caller-supplied fields
    ManualValue,
}

/// Caller input to manual conflict resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// How to resolve
    pub strategy: ResolutionStrategy,
    /// Resolved fields, required for `ManualValue`
    pub value: Option<ItemFields>,
    /// The `detected_at` the caller read from the conflict. When set, a
    /// mismatch with the live conflict means the conflict was superseded
    /// and the resolution is rejected as stale.
    pub observed_at: Option<i64>,
}

impl ConflictResolution {
    /// Resolution that keeps the named side
    #[must_use]
    pub const fn keep_local() -> Self {
        Self {
            strategy: ResolutionStrategy::LocalWins,
            value: None,
            observed_at: None,
        }
    }

    /// Resolution that keeps the remote side
    #[must_use]
    pub const fn keep_remote() -> Self {
        Self {
            strategy: ResolutionStrategy::RemoteWins,
            value: None,
            observed_at: None,
        }
    }

    /// Field-level merge resolution
    #[must_use]
    pub const fn merge() -> Self {
        Self {
            strategy: ResolutionStrategy::Merge,
            value: None,
            observed_at: None,
        }
    }

    /// Resolution with caller-supplied fields
    #[must_use]
    pub const fn manual(value: ItemFields) -> Self {
        Self {
            strategy: ResolutionStrategy::ManualValue,
            value: Some(value),
            observed_at: None,
        }
    }

    /// Guard this resolution against supersede: reject as stale if the
    /// conflict's `detected_at` no longer matches.
    #[must_use]
    pub const fn observed_at(mut self, detected_at: i64) -> Self {
        self.observed_at = Some(detected_at);
        self
    }
}
