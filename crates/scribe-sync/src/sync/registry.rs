//! Conflict registry
//!
//! Holds unresolved conflicts across sync passes until a caller resolves
//! them. The registry is an explicitly owned, injectable component rather
//! than process-wide state; tests construct isolated instances. All
//! mutations are serialized behind one mutex so a manual resolution cannot
//! race a pass re-detecting the same divergence.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictResolution, ItemFields, ResolutionStrategy, RevisionedItem, SyncConflict,
};
use crate::sync::resolve::{confirm, keep_unconfirmed, max_revision, merge_items};

/// Registry of conflicts, ordered by first detection.
#[derive(Debug, Default)]
pub struct ConflictRegistry {
    inner: Mutex<Vec<SyncConflict>>,
}

impl ConflictRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Vec<SyncConflict>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly detected conflict, superseding rather than
    /// duplicating any live conflict on the same item.
    ///
    /// Returns the id of the live conflict: the existing id is reused when
    /// an unresolved conflict is superseded, a new one is issued when a
    /// resolved entry is re-opened by a remote change newer than its
    /// resolution. Returns `None` when the detection is dropped because
    /// the item was already resolved and the remote did not change since.
    pub fn upsert(&self, conflict: SyncConflict) -> Option<ConflictId> {
        let mut conflicts = self.locked();
        let existing = conflicts
            .iter_mut()
            .find(|entry| entry.item_kind == conflict.item_kind && entry.item_id == conflict.item_id);

        let Some(entry) = existing else {
            let id = conflict.id;
            debug!(conflict = %id, item = %conflict.item_id, "registered new conflict");
            conflicts.push(conflict);
            return Some(id);
        };

        if entry.resolved {
            // A resolved divergence only re-opens if the remote moved again
            // after the resolution was recorded.
            let resolved_at = entry.resolved_at.unwrap_or(i64::MAX);
            let remote_moved = conflict
                .remote_version
                .as_ref()
                .is_some_and(|remote| remote.updated_at > resolved_at);
            if !remote_moved {
                debug!(item = %conflict.item_id, "dropping re-detection of resolved conflict");
                return None;
            }
            let id = conflict.id;
            info!(item = %conflict.item_id, "resolved conflict re-opened by newer remote change");
            *entry = conflict;
            return Some(id);
        }

        // Same live divergence: keep the id so repeated passes never
        // accumulate duplicates. Only bump the snapshots when they actually
        // changed, so a pending manual resolution is not spuriously staled.
        if entry.local_version == conflict.local_version
            && entry.remote_version == conflict.remote_version
            && entry.reason == conflict.reason
        {
            return Some(entry.id);
        }
        entry.local_version = conflict.local_version;
        entry.remote_version = conflict.remote_version;
        entry.reason = conflict.reason;
        entry.detected_at = conflict.detected_at;
        Some(entry.id)
    }

    /// Look up a conflict by id
    #[must_use]
    pub fn get(&self, id: ConflictId) -> Option<SyncConflict> {
        self.locked().iter().find(|entry| entry.id == id).cloned()
    }

    /// All conflicts, unresolved and resolved, in detection order
    #[must_use]
    pub fn list(&self) -> Vec<SyncConflict> {
        self.locked().clone()
    }

    /// Unresolved conflicts only, in detection order
    #[must_use]
    pub fn list_unresolved(&self) -> Vec<SyncConflict> {
        self.locked()
            .iter()
            .filter(|entry| !entry.resolved)
            .cloned()
            .collect()
    }

    /// Apply a resolution to a stored conflict and return the resolved
    /// item for the caller to write back locally.
    pub fn resolve(
        &self,
        id: ConflictId,
        resolution: &ConflictResolution,
        now: i64,
    ) -> Result<RevisionedItem> {
        let mut conflicts = self.locked();
        let entry = conflicts
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| Error::ConflictNotFound(id.as_str()))?;

        if entry.resolved {
            return Err(Error::AlreadyResolved(id.as_str()));
        }
        if let Some(observed_at) = resolution.observed_at {
            if observed_at != entry.detected_at {
                return Err(Error::StaleResolution(id.as_str()));
            }
        }

        let item = apply_strategy(entry, resolution, now)?;
        entry.resolved = true;
        entry.resolved_item = Some(item.clone());
        entry.resolved_at = Some(now);
        info!(conflict = %id, item = %entry.item_id, strategy = ?resolution.strategy, "conflict resolved");
        Ok(item)
    }

    /// Drop entries that have been resolved
    pub fn clear_resolved(&self) {
        self.locked().retain(|entry| !entry.resolved);
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.locked().clear();
    }
}

fn apply_strategy(
    conflict: &SyncConflict,
    resolution: &ConflictResolution,
    now: i64,
) -> Result<RevisionedItem> {
    let local = conflict.local_version.as_ref();
    let remote = conflict.remote_version.as_ref();
    let revision = max_revision(local, remote);

    match resolution.strategy {
        ResolutionStrategy::LocalWins => {
            // The kept content never reached the remote; the copy stays
            // dirty so a later remote change re-detects the divergence and
            // the re-open rules apply.
            let local = local.ok_or_else(|| {
                Error::InvalidInput(format!("conflict {} has no local snapshot", conflict.id))
            })?;
            Ok(keep_unconfirmed(local, revision))
        }
        ResolutionStrategy::RemoteWins => {
            let remote = remote.ok_or_else(|| {
                Error::InvalidInput(format!("conflict {} has no remote snapshot", conflict.id))
            })?;
            Ok(confirm(remote, revision, now))
        }
        ResolutionStrategy::Merge => {
            let (Some(local), Some(remote)) = (local, remote) else {
                return Err(Error::InvalidInput(format!(
                    "conflict {} is one-sided and cannot be merged",
                    conflict.id
                )));
            };
            merge_items(local, remote)
        }
        ResolutionStrategy::ManualValue => {
            let fields = resolution
                .value
                .clone()
                .ok_or(Error::MissingManualValue)?;
            if fields.kind() != conflict.item_kind {
                return Err(Error::InvalidInput(format!(
                    "manual value kind does not match conflict on {} {}",
                    conflict.item_kind, conflict.item_id
                )));
            }
            Ok(manual_item(conflict, fields, revision, now))
        }
    }
}

/// Hand-picked fields exist on neither replica; the result is a new,
/// unconfirmed local edit.
fn manual_item(
    conflict: &SyncConflict,
    fields: ItemFields,
    revision: Option<u64>,
    now: i64,
) -> RevisionedItem {
    RevisionedItem {
        id: conflict.item_id,
        revision,
        updated_at: now,
        synced_at: None,
        is_deleted: false,
        fields,
    }
}
