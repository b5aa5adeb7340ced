//! Merge resolver
//!
//! Takes a classified item pair and either produces the merged item or a
//! `SyncConflict` for the registry. Tag sets are unioned, scalar fields
//! fall back to last-writer-wins, and free-text note content is never
//! merged automatically: if both sides changed it, the result is a
//! conflict regardless of the configured strategy.
//!
//! Only winners whose content the remote is known to hold get a new
//! common base (`synced_at`). Winners carrying content the remote never
//! received stay dirty, so a later remote change is detected as a
//! conflict instead of overwriting the unpropagated edit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::models::{
    ConflictReason, ItemFields, NoteFields, RevisionedItem, SyncConflict,
};
use crate::sync::detect::Relation;
use crate::util::normalize_tag;

/// Configured strategy for divergences the detector cannot order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Local replica always wins
    LocalWins,
    /// Remote replica always wins
    RemoteWins,
    /// Field-level reconciliation where safe, conflict otherwise
    #[default]
    Merge,
    /// Every divergence becomes a conflict for manual resolution
    Manual,
}

/// Outcome of resolving one classified pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The unambiguous or merged winner, to be written back locally
    Item(RevisionedItem),
    /// Automatic resolution was not safe; a decision is required
    Conflict(SyncConflict),
}

/// Resolve a classified pair under the configured strategy.
///
/// `now` is the pass timestamp used to stamp remote-confirmed winners with
/// their new common base.
pub fn resolve(
    relation: Relation,
    local: Option<&RevisionedItem>,
    remote: Option<&RevisionedItem>,
    strategy: MergeStrategy,
    now: i64,
) -> Result<Resolved> {
    match relation {
        Relation::LocalOnly => {
            // Never synced to the remote; kept as-is (push is out of scope).
            let local = require(local, "local")?;
            Ok(Resolved::Item(local.clone()))
        }
        Relation::RemoteOnly => {
            let remote = require(remote, "remote")?;
            Ok(Resolved::Item(confirm(remote, remote.revision, now)))
        }
        Relation::Identical => {
            let local = require(local, "local")?;
            let revision = max_revision(Some(local), remote);
            Ok(Resolved::Item(confirm(local, revision, now)))
        }
        Relation::LocalAhead => {
            // The remote never received this content; the copy stays dirty
            // until a push confirms it.
            let local = require(local, "local")?;
            let revision = max_revision(Some(local), remote);
            Ok(Resolved::Item(keep_unconfirmed(local, revision)))
        }
        Relation::RemoteAhead => {
            let remote = require(remote, "remote")?;
            let revision = max_revision(local, Some(remote));
            Ok(Resolved::Item(confirm(remote, revision, now)))
        }
        Relation::Conflict | Relation::DeleteVsEdit => {
            let local = require(local, "local")?;
            let remote = require(remote, "remote")?;
            resolve_divergence(relation, local, remote, strategy, now)
        }
    }
}

fn resolve_divergence(
    relation: Relation,
    local: &RevisionedItem,
    remote: &RevisionedItem,
    strategy: MergeStrategy,
    now: i64,
) -> Result<Resolved> {
    let revision = max_revision(Some(local), Some(remote));
    match strategy {
        // Explicit user choice to prioritize one replica: the named side
        // wins outright, including over tombstones. A kept local copy is
        // still unconfirmed content as far as the remote knows.
        MergeStrategy::LocalWins => Ok(Resolved::Item(keep_unconfirmed(local, revision))),
        MergeStrategy::RemoteWins => Ok(Resolved::Item(confirm(remote, revision, now))),
        MergeStrategy::Manual => Ok(Resolved::Conflict(conflict_for(
            relation, local, remote, now,
        ))),
        MergeStrategy::Merge => {
            if relation == Relation::DeleteVsEdit {
                // Never auto-delete user edits.
                return Ok(Resolved::Conflict(conflict_for(relation, local, remote, now)));
            }
            match merge_items(local, remote) {
                Ok(merged) => Ok(Resolved::Item(merged)),
                Err(Error::UnresolvableContent) => Ok(Resolved::Conflict(SyncConflict::new(
                    local.kind(),
                    local.id,
                    Some(local.clone()),
                    Some(remote.clone()),
                    ConflictReason::ContentDivergence,
                    now,
                ))),
                Err(err) => Err(err),
            }
        }
    }
}

/// Field-level merge of two divergent copies.
///
/// Fails with [`Error::UnresolvableContent`] when both sides carry
/// different note content, and with [`Error::InvalidInput`] when the two
/// copies are not the same kind of item.
pub fn merge_items(local: &RevisionedItem, remote: &RevisionedItem) -> Result<RevisionedItem> {
    let fields = merge_fields(local, remote)?;
    // The merged combination exists on neither replica yet, so the result
    // keeps the local copy's dirty markers until a push confirms it.
    Ok(RevisionedItem {
        id: local.id,
        revision: max_revision(Some(local), Some(remote)),
        updated_at: local.updated_at.max(remote.updated_at),
        synced_at: local.synced_at,
        is_deleted: false,
        fields,
    })
}

fn merge_fields(local: &RevisionedItem, remote: &RevisionedItem) -> Result<ItemFields> {
    let local_newer = local_is_newer(local, remote);

    match (&local.fields, &remote.fields) {
        (ItemFields::Note(local_note), ItemFields::Note(remote_note)) => {
            if local_note.content != remote_note.content {
                return Err(Error::UnresolvableContent);
            }
            let newer = if local_newer { local_note } else { remote_note };
            Ok(ItemFields::Note(NoteFields {
                title: newer.title.clone(),
                content: local_note.content.clone(),
                tags: union_tags(&local_note.tags, &remote_note.tags),
                notebook_id: newer.notebook_id,
            }))
        }
        (ItemFields::Notebook(_), ItemFields::Notebook(_)) => {
            // Name, color, and parent are all scalars: the most recently
            // updated side supplies them wholesale.
            let newer = if local_newer { local } else { remote };
            Ok(newer.fields.clone())
        }
        _ => Err(Error::InvalidInput(format!(
            "item {} changed kind between replicas",
            local.id
        ))),
    }
}

fn union_tags(local: &BTreeSet<String>, remote: &BTreeSet<String>) -> BTreeSet<String> {
    local
        .iter()
        .chain(remote.iter())
        .map(|tag| normalize_tag(tag))
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Most-recently-updated ordering for scalar merges: `updated_at` first,
/// then revision, with remaining ties favoring local.
fn local_is_newer(local: &RevisionedItem, remote: &RevisionedItem) -> bool {
    if local.updated_at != remote.updated_at {
        return local.updated_at > remote.updated_at;
    }
    match (local.revision, remote.revision) {
        (Some(l), Some(r)) if l != r => l > r,
        _ => true,
    }
}

/// Higher of the two revision counters; the new common base after a merge.
pub(crate) fn max_revision(
    local: Option<&RevisionedItem>,
    remote: Option<&RevisionedItem>,
) -> Option<u64> {
    let local = local.and_then(|item| item.revision);
    let remote = remote.and_then(|item| item.revision);
    match (local, remote) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (revision, None) | (None, revision) => revision,
    }
}

/// Clone a winner whose content the remote is known to hold and stamp it
/// with the new common base. Items that are already clean keep their
/// markers, so back-to-back passes return identical collections.
pub(crate) fn confirm(winner: &RevisionedItem, revision: Option<u64>, now: i64) -> RevisionedItem {
    let mut out = winner.clone();
    if out.changed_since_sync() || out.revision != revision {
        out.synced_at = Some(now);
    }
    out.revision = revision;
    out
}

/// Clone a winner carrying content the remote has not confirmed. The
/// revision records the remote state the decision was made against, but
/// `synced_at` is untouched: the copy still reads as changed, so a later
/// remote edit classifies as a conflict instead of overwriting it. An
/// unchanged remote re-selects the same copy, keeping passes idempotent.
pub(crate) fn keep_unconfirmed(winner: &RevisionedItem, revision: Option<u64>) -> RevisionedItem {
    let mut out = winner.clone();
    out.revision = revision;
    out
}

fn conflict_for(
    relation: Relation,
    local: &RevisionedItem,
    remote: &RevisionedItem,
    now: i64,
) -> SyncConflict {
    let reason = if relation == Relation::DeleteVsEdit {
        ConflictReason::DeleteVsEdit
    } else {
        ConflictReason::ConcurrentEdit
    };
    SyncConflict::new(
        local.kind(),
        local.id,
        Some(local.clone()),
        Some(remote.clone()),
        reason,
        now,
    )
}

fn require<'a>(
    side: Option<&'a RevisionedItem>,
    name: &str,
) -> Result<&'a RevisionedItem> {
    side.ok_or_else(|| Error::InvalidInput(format!("missing {name} side for relation")))
}
