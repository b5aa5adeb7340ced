//! Divergence detector
//!
//! Classifies how the local and remote copies of one item relate to each
//! other. The ordering scheme is a monotonic per-item revision counter:
//! the local copy's `revision` is the remote revision it was last
//! reconciled against (the common base), the remote snapshot's `revision`
//! is the remote's current counter, and `updated_at` is only a
//! tie-break/fallback.

use crate::error::{Error, Result};
use crate::models::RevisionedItem;

/// Relationship between the local and remote copies of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Remote absent; keep local (push is out of scope, treated as accept-local)
    LocalOnly,
    /// Local absent; adopt remote as a new local item
    RemoteOnly,
    /// No divergence; no-op
    Identical,
    /// Local changed since the common base, remote did not; accept local
    LocalAhead,
    /// Remote changed since the common base, local did not; accept remote
    RemoteAhead,
    /// Both sides changed since the common base
    Conflict,
    /// One side tombstoned the item, the other edited it
    DeleteVsEdit,
}

/// Classify an item pair. Either side may be absent; both absent is
/// excluded by the pairing step and rejected as invalid input.
pub fn classify(
    local: Option<&RevisionedItem>,
    remote: Option<&RevisionedItem>,
) -> Result<Relation> {
    match (local, remote) {
        (None, None) => Err(Error::InvalidInput(
            "cannot classify a pair with both sides absent".to_string(),
        )),
        (Some(_), None) => Ok(Relation::LocalOnly),
        (None, Some(_)) => Ok(Relation::RemoteOnly),
        (Some(local), Some(remote)) => Ok(classify_pair(local, remote)),
    }
}

fn classify_pair(local: &RevisionedItem, remote: &RevisionedItem) -> Relation {
    // Equal fields and tombstone flags mean no divergence regardless of
    // what the change markers say (both sides made the same edit).
    if local.is_deleted == remote.is_deleted && local.fields == remote.fields {
        return Relation::Identical;
    }
    // Two tombstones agree; stale field differences are irrelevant.
    if local.is_deleted && remote.is_deleted {
        return Relation::Identical;
    }

    let Some(remote_changed) = remote_changed_since_base(local, remote) else {
        // No common base at all: order by updated_at, per the fallback
        // rules for items that never synced together.
        return last_writer_order(local, remote);
    };
    let local_changed = local.changed_since_sync();

    match (local_changed, remote_changed) {
        (false, false) => Relation::Identical,
        (true, false) => Relation::LocalAhead,
        (false, true) => Relation::RemoteAhead,
        (true, true) => {
            if local.is_deleted != remote.is_deleted {
                Relation::DeleteVsEdit
            } else {
                Relation::Conflict
            }
        }
    }
}

/// Whether the remote copy changed since the last common base, or `None`
/// when no base exists (the two copies never synced together).
fn remote_changed_since_base(local: &RevisionedItem, remote: &RevisionedItem) -> Option<bool> {
    if let (Some(base), Some(current)) = (local.revision, remote.revision) {
        return Some(current > base);
    }
    local
        .synced_at
        .map(|synced| remote.updated_at > synced)
}

/// Fallback ordering when there is no common base: last writer wins by
/// `updated_at`; ties favor the local side, so the user's own unsynced
/// edit is never silently discarded.
fn last_writer_order(local: &RevisionedItem, remote: &RevisionedItem) -> Relation {
    // A tombstone on one side with a later edit on the other still needs a
    // decision; auto-deleting edits is never safe.
    if local.is_deleted && remote.updated_at > local.updated_at {
        return Relation::DeleteVsEdit;
    }
    if remote.is_deleted && local.updated_at > remote.updated_at {
        return Relation::DeleteVsEdit;
    }

    if local.updated_at > remote.updated_at {
        return Relation::LocalAhead;
    }
    if remote.updated_at > local.updated_at {
        return Relation::RemoteAhead;
    }
    // Equal timestamps. Both revisions being present never reaches this
    // path (the base comparison handles it), so the only tie-break left
    // is to favor the local side.
    Relation::LocalAhead
}
