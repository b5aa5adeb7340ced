//! Sync session controller
//!
//! Orchestrates one reconciliation pass over the full collections: pairs
//! local and remote items by id, classifies and resolves each pair, and
//! publishes a single `SyncState` to subscribers once the pass completes
//! or fails. Notes are processed before notebooks so note-to-notebook
//! references stay resolvable when a notebook was concurrently renamed or
//! deleted. The engine returns new collections and owns no persistence;
//! the caller writes results back.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictReason, ConflictResolution, ItemId, ItemKind, RevisionedItem,
    SyncConflict, SyncState, SyncStatus,
};
use crate::sync::detect::classify;
use crate::sync::registry::ConflictRegistry;
use crate::sync::resolve::{resolve, MergeStrategy, Resolved};
use crate::util::now_ms;

/// Engine configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Strategy applied to divergences the detector cannot order
    pub strategy: MergeStrategy,
}

/// The remote replica as one opaque snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub notes: Vec<RevisionedItem>,
    pub notebooks: Vec<RevisionedItem>,
}

/// Result of one completed pass, for the caller to write back locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Reconciled notes (winners, merges, and locals awaiting resolution)
    pub synced_notes: Vec<RevisionedItem>,
    /// Reconciled notebooks
    pub synced_notebooks: Vec<RevisionedItem>,
    /// Conflicts live after this pass, as registered
    pub conflicts: Vec<SyncConflict>,
}

/// Handle for removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// Sync session controller; one instance per local collection.
///
/// Only one pass may be in flight at a time: a `start_sync` or `sync_with`
/// call while a pass is running is rejected with [`Error::SyncInProgress`].
pub struct SyncEngine {
    options: SyncOptions,
    registry: Arc<ConflictRegistry>,
    state: Mutex<SyncState>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_subscription: AtomicU64,
}

impl SyncEngine {
    /// Create an engine with its own conflict registry
    #[must_use]
    pub fn new(options: SyncOptions) -> Self {
        Self::with_registry(options, Arc::new(ConflictRegistry::new()))
    }

    /// Create an engine over an injected registry (shared or test-scoped)
    #[must_use]
    pub fn with_registry(options: SyncOptions, registry: Arc<ConflictRegistry>) -> Self {
        Self {
            options,
            registry,
            state: Mutex::new(SyncState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// The conflict registry backing this engine
    #[must_use]
    pub fn registry(&self) -> Arc<ConflictRegistry> {
        Arc::clone(&self.registry)
    }

    fn state_locked(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session state snapshot
    #[must_use]
    pub fn get_sync_state(&self) -> SyncState {
        self.state_locked().clone()
    }

    /// Register a callback invoked synchronously, in registration order,
    /// after each completed or failed pass and after manual registry
    /// operations.
    ///
    /// Callbacks may call back into the engine. The list is snapshotted
    /// before delivery, so subscriptions added or removed inside a callback
    /// take effect from the next publication.
    pub fn subscribe(&self, callback: impl Fn(&SyncState) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers_locked().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers_locked().retain(|(sub, _)| *sub != id);
    }

    fn subscribers_locked(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_subscribers(&self) {
        let state = self.get_sync_state();
        let callbacks: Vec<Callback> = self
            .subscribers_locked()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&state);
        }
    }

    /// Run one reconciliation pass over already-fetched remote snapshots.
    pub fn start_sync(
        &self,
        local_notes: &[RevisionedItem],
        local_notebooks: &[RevisionedItem],
        remote_notes: &[RevisionedItem],
        remote_notebooks: &[RevisionedItem],
    ) -> Result<SyncOutcome> {
        let mut guard = self.begin_pass()?;
        let outcome = self.run_pass(local_notes, local_notebooks, remote_notes, remote_notebooks);
        self.finish_pass(&outcome);
        guard.disarm();
        Ok(outcome)
    }

    /// Fetch the remote snapshot and run one pass.
    ///
    /// The fetch is the only suspension point. Dropping the returned future
    /// before the fetch resolves cancels the pass and leaves local state
    /// untouched, the same guarantee as a fetch failure.
    pub async fn sync_with<F>(
        &self,
        local_notes: &[RevisionedItem],
        local_notebooks: &[RevisionedItem],
        fetch: F,
    ) -> Result<SyncOutcome>
    where
        F: Future<Output = Result<RemoteSnapshot>>,
    {
        let mut guard = self.begin_pass()?;

        let snapshot = match fetch.await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "remote fetch failed; pass aborted");
                self.fail_pass(&message);
                guard.disarm();
                return Err(Error::FetchFailed(message));
            }
        };

        let outcome = self.run_pass(
            local_notes,
            local_notebooks,
            &snapshot.notes,
            &snapshot.notebooks,
        );
        self.finish_pass(&outcome);
        guard.disarm();
        Ok(outcome)
    }

    /// Apply a resolution to a registered conflict and return the resolved
    /// item for the caller to write back.
    pub fn resolve_conflict_manually(
        &self,
        id: ConflictId,
        resolution: &ConflictResolution,
    ) -> Result<RevisionedItem> {
        let item = self.registry.resolve(id, resolution, now_ms())?;
        self.refresh_conflicts();
        self.notify_subscribers();
        Ok(item)
    }

    /// Drop resolved conflicts from the registry
    pub fn clear_resolved_conflicts(&self) {
        self.registry.clear_resolved();
        self.refresh_conflicts();
        self.notify_subscribers();
    }

    /// Reset the published session state; intended for idle sessions.
    /// Conflicts remain registry-owned and are re-read, not cleared.
    pub fn reset_sync_state(&self) {
        {
            let mut state = self.state_locked();
            *state = SyncState {
                conflicts: self.registry.list(),
                ..SyncState::default()
            };
        }
        self.notify_subscribers();
    }

    fn refresh_conflicts(&self) {
        let conflicts = self.registry.list();
        self.state_locked().conflicts = conflicts;
    }

    fn begin_pass(&self) -> Result<PassGuard<'_>> {
        let mut state = self.state_locked();
        if state.status == SyncStatus::Syncing {
            return Err(Error::SyncInProgress);
        }
        state.status = SyncStatus::Syncing;
        state.progress = 0;
        Ok(PassGuard {
            engine: self,
            armed: true,
        })
    }

    fn fail_pass(&self, message: &str) {
        {
            let mut state = self.state_locked();
            state.status = SyncStatus::Error;
            state.last_error = Some(message.to_string());
        }
        self.notify_subscribers();
    }

    fn finish_pass(&self, outcome: &SyncOutcome) {
        let now = now_ms();
        {
            let mut state = self.state_locked();
            state.status = SyncStatus::Idle;
            state.progress = 100;
            state.last_sync = Some(now);
            state.last_error = None;
            state.conflicts = self.registry.list();
        }
        info!(
            notes = outcome.synced_notes.len(),
            notebooks = outcome.synced_notebooks.len(),
            conflicts = outcome.conflicts.len(),
            "sync pass complete"
        );
        self.notify_subscribers();
    }

    fn run_pass(
        &self,
        local_notes: &[RevisionedItem],
        local_notebooks: &[RevisionedItem],
        remote_notes: &[RevisionedItem],
        remote_notebooks: &[RevisionedItem],
    ) -> SyncOutcome {
        let now = now_ms();
        let mut progress = Progress::new(
            total_pairs(local_notes, remote_notes) + total_pairs(local_notebooks, remote_notebooks),
        );

        let (synced_notes, mut conflicts) =
            self.reconcile_collection(local_notes, remote_notes, now, &mut progress);
        let (synced_notebooks, notebook_conflicts) =
            self.reconcile_collection(local_notebooks, remote_notebooks, now, &mut progress);
        conflicts.extend(notebook_conflicts);

        // Register this pass's conflicts; upsert supersedes live entries
        // instead of duplicating and drops re-detections of divergences
        // already resolved.
        let live: Vec<SyncConflict> = conflicts
            .into_iter()
            .filter_map(|conflict| {
                let id = self.registry.upsert(conflict)?;
                self.registry.get(id)
            })
            .collect();

        SyncOutcome {
            synced_notes,
            synced_notebooks,
            conflicts: live,
        }
    }

    fn reconcile_collection(
        &self,
        local: &[RevisionedItem],
        remote: &[RevisionedItem],
        now: i64,
        progress: &mut Progress,
    ) -> (Vec<RevisionedItem>, Vec<SyncConflict>) {
        let remote_by_id: HashMap<ItemId, &RevisionedItem> =
            remote.iter().map(|item| (item.id, item)).collect();
        let local_ids: HashSet<ItemId> = local.iter().map(|item| item.id).collect();

        let mut synced = Vec::with_capacity(local.len());
        let mut conflicts = Vec::new();

        for item in local {
            let pair = remote_by_id.get(&item.id).copied();
            match self.process_pair(Some(item), pair, now) {
                Resolved::Item(resolved) => synced.push(resolved),
                Resolved::Conflict(conflict) => {
                    // Keep the local copy in the written-back collection so
                    // an unresolved divergence never drops user data.
                    synced.push(item.clone());
                    conflicts.push(conflict);
                }
            }
            self.advance(progress);
        }

        for item in remote {
            if local_ids.contains(&item.id) {
                continue;
            }
            match self.process_pair(None, Some(item), now) {
                Resolved::Item(resolved) => synced.push(resolved),
                Resolved::Conflict(conflict) => conflicts.push(conflict),
            }
            self.advance(progress);
        }

        (synced, conflicts)
    }

    /// Classify and resolve one pair. Any per-item failure is isolated to
    /// a malformed-item conflict instead of aborting the pass.
    fn process_pair(
        &self,
        local: Option<&RevisionedItem>,
        remote: Option<&RevisionedItem>,
        now: i64,
    ) -> Resolved {
        for side in [local, remote].into_iter().flatten() {
            if let Err(err) = side.validate() {
                warn!(item = %side.id, error = %err, "malformed item excluded from pass");
                return Resolved::Conflict(malformed_conflict(local, remote, now));
            }
        }

        let relation = match classify(local, remote) {
            Ok(relation) => relation,
            Err(err) => {
                warn!(error = %err, "classification failed");
                return Resolved::Conflict(malformed_conflict(local, remote, now));
            }
        };
        debug!(?relation, "classified pair");

        match resolve(relation, local, remote, self.options.strategy, now) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(error = %err, "resolution failed");
                Resolved::Conflict(malformed_conflict(local, remote, now))
            }
        }
    }

    fn advance(&self, progress: &mut Progress) {
        progress.processed += 1;
        self.state_locked().progress = progress.percent();
    }
}

/// Restores `Idle` if a pass is abandoned (cancelled fetch or panic)
/// without publishing any partial results.
struct PassGuard<'a> {
    engine: &'a SyncEngine,
    armed: bool,
}

impl PassGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.engine.state_locked();
            if state.status == SyncStatus::Syncing {
                state.status = SyncStatus::Idle;
                state.progress = 0;
            }
        }
    }
}

struct Progress {
    processed: usize,
    total: usize,
}

impl Progress {
    const fn new(total: usize) -> Self {
        Self {
            processed: 0,
            total,
        }
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        u8::try_from(self.processed * 100 / self.total).unwrap_or(100)
    }
}

/// Items to process in one collection: every local item plus every remote
/// item with no local counterpart.
fn total_pairs(local: &[RevisionedItem], remote: &[RevisionedItem]) -> usize {
    let local_ids: HashSet<ItemId> = local.iter().map(|item| item.id).collect();
    local.len()
        + remote
            .iter()
            .filter(|item| !local_ids.contains(&item.id))
            .count()
}

fn malformed_conflict(
    local: Option<&RevisionedItem>,
    remote: Option<&RevisionedItem>,
    now: i64,
) -> SyncConflict {
    // The pairing step guarantees at least one side; fall back to an
    // empty-id conflict only if that ever breaks.
    let any = local.or(remote);
    let (kind, id) = any.map_or_else(
        || (ItemKind::Note, ItemId::new()),
        |item| (item.kind(), item.id),
    );
    SyncConflict::new(
        kind,
        id,
        local.cloned(),
        remote.cloned(),
        ConflictReason::MalformedItem,
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemFields, NoteFields, NotebookFields};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    const BASE_TS: i64 = 1_000;

    fn synced_note(content: &str, tags: &[&str]) -> RevisionedItem {
        let mut note = RevisionedItem::new_note(NoteFields {
            title: "Title".to_string(),
            content: content.to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
            notebook_id: None,
        });
        note.revision = Some(3);
        note.updated_at = BASE_TS;
        note.synced_at = Some(BASE_TS);
        note
    }

    fn remote_twin(local: &RevisionedItem) -> RevisionedItem {
        let mut remote = local.clone();
        remote.synced_at = None;
        remote
    }

    fn edit_content(item: &mut RevisionedItem, content: &str, at: i64) {
        if let ItemFields::Note(fields) = &mut item.fields {
            fields.content = content.to_string();
        }
        item.updated_at = at;
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(SyncOptions::default())
    }

    #[test]
    fn test_local_ahead_scenario() {
        // Local edits the title at T+10, remote unchanged from base.
        let base = synced_note("Body", &[]);
        let remote = remote_twin(&base);
        let mut local = base;
        if let ItemFields::Note(fields) = &mut local.fields {
            fields.title = "New title".to_string();
        }
        local.updated_at = BASE_TS + 10;

        let engine = engine();
        let outcome = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 0);
        assert_eq!(outcome.synced_notes.len(), 1);
        assert_eq!(outcome.synced_notes[0].fields, local.fields);
    }

    #[test]
    fn test_delete_vs_edit_scenario() {
        // Local deletes at T+5, remote edits content at T+8.
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        local.is_deleted = true;
        local.updated_at = BASE_TS + 5;
        let mut remote = remote_twin(&base);
        edit_content(&mut remote, "remote edit", BASE_TS + 8);
        remote.revision = Some(4);

        let engine = engine();
        let outcome = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.reason, ConflictReason::DeleteVsEdit);
        assert!(!conflict.resolved);
        assert!(conflict.local_version.as_ref().unwrap().is_deleted);
        assert_eq!(
            conflict.remote_version.as_ref().unwrap().updated_at,
            BASE_TS + 8
        );
    }

    #[test]
    fn test_tag_union_scenario() {
        // Local adds "urgent", remote adds "work", no other changes.
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        if let ItemFields::Note(fields) = &mut local.fields {
            fields.tags.insert("urgent".to_string());
        }
        local.updated_at = BASE_TS + 5;
        let mut remote = remote_twin(&base);
        if let ItemFields::Note(fields) = &mut remote.fields {
            fields.tags.insert("work".to_string());
        }
        remote.updated_at = BASE_TS + 8;
        remote.revision = Some(4);

        let engine = engine();
        let outcome = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 0);
        let ItemFields::Note(note) = &outcome.synced_notes[0].fields else {
            panic!("expected note fields");
        };
        let expected: BTreeSet<String> =
            ["urgent", "work"].iter().map(ToString::to_string).collect();
        assert_eq!(note.tags, expected);
    }

    #[test]
    fn test_concurrent_content_edits_always_conflict() {
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "local edit", BASE_TS + 5);
        let mut remote = remote_twin(&base);
        edit_content(&mut remote, "remote edit", BASE_TS + 8);
        remote.revision = Some(4);

        for strategy in [MergeStrategy::Merge, MergeStrategy::Manual] {
            let engine = SyncEngine::new(SyncOptions { strategy });
            let outcome = engine
                .start_sync(
                    std::slice::from_ref(&local),
                    &[],
                    std::slice::from_ref(&remote),
                    &[],
                )
                .unwrap();
            assert_eq!(outcome.conflicts.len(), 1, "strategy {strategy:?}");
            // The local copy is still written back; nothing is dropped.
            assert_eq!(outcome.synced_notes[0], local);
        }
    }

    #[test]
    fn test_unsynced_local_edit_survives_later_remote_change() {
        // Pass 1: local edits content, remote unchanged from base.
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "precious local edit", BASE_TS + 5);
        let remote_unchanged = remote_twin(&base);

        let engine = engine();
        let first = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote_unchanged),
                &[],
            )
            .unwrap();
        assert_eq!(first.conflicts.len(), 0);
        assert_eq!(first.synced_notes[0].fields, local.fields);
        // Not pushed anywhere yet, so the copy must still read as changed.
        assert!(first.synced_notes[0].changed_since_sync());

        // Pass 2: the remote independently rewrites the content. The local
        // edit was never propagated; overwriting it would be data loss.
        let mut remote_rewrite = remote_twin(&base);
        edit_content(&mut remote_rewrite, "remote rewrite", BASE_TS + 20);
        remote_rewrite.revision = Some(4);

        let second = engine
            .start_sync(
                &first.synced_notes,
                &[],
                std::slice::from_ref(&remote_rewrite),
                &[],
            )
            .unwrap();
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].reason, ConflictReason::ContentDivergence);
        let ItemFields::Note(note) = &second.synced_notes[0].fields else {
            panic!("expected note fields");
        };
        assert_eq!(note.content, "precious local edit");
    }

    #[test]
    fn test_resolved_keep_local_reopens_when_remote_moves_again() {
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "local edit", BASE_TS + 5);
        let mut remote = remote_twin(&base);
        edit_content(&mut remote, "remote edit", BASE_TS + 8);
        remote.revision = Some(4);

        let engine = engine();
        let first = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();
        let original = first.conflicts[0].id;

        let resolved = engine
            .resolve_conflict_manually(original, &ConflictResolution::keep_local())
            .unwrap();
        assert!(resolved.changed_since_sync());

        // Same remote state: the resolution sticks, no re-detection.
        let second = engine
            .start_sync(
                std::slice::from_ref(&resolved),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();
        assert!(second.conflicts.is_empty());
        assert_eq!(second.synced_notes[0].fields, local.fields);

        // The remote moves again after the resolution: fresh conflict, the
        // resolved value is not silently replaced.
        let mut moved = remote.clone();
        edit_content(&mut moved, "remote moved again", crate::util::now_ms() + 1_000);
        moved.revision = Some(5);

        let third = engine
            .start_sync(
                &second.synced_notes,
                &[],
                std::slice::from_ref(&moved),
                &[],
            )
            .unwrap();
        assert_eq!(third.conflicts.len(), 1);
        assert_ne!(third.conflicts[0].id, original);
        assert!(!third.conflicts[0].resolved);
        let ItemFields::Note(note) = &third.synced_notes[0].fields else {
            panic!("expected note fields");
        };
        assert_eq!(note.content, "local edit");
    }

    #[test]
    fn test_remote_only_items_are_imported() {
        let remote = remote_twin(&synced_note("Body", &[]));

        let engine = engine();
        let outcome = engine
            .start_sync(&[], &[], std::slice::from_ref(&remote), &[])
            .unwrap();

        assert_eq!(outcome.synced_notes.len(), 1);
        assert_eq!(outcome.synced_notes[0].id, remote.id);
        assert!(outcome.synced_notes[0].synced_at.is_some());
    }

    #[test]
    fn test_idempotent_back_to_back_passes() {
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "local edit", BASE_TS + 5);
        let mut conflicted_remote = remote_twin(&base);
        edit_content(&mut conflicted_remote, "remote edit", BASE_TS + 8);
        conflicted_remote.revision = Some(4);

        let fresh_remote = remote_twin(&synced_note("Another", &["a"]));

        let engine = engine();
        let locals = vec![local];
        let remotes = vec![conflicted_remote, fresh_remote];

        let first = engine.start_sync(&locals, &[], &remotes, &[]).unwrap();

        // Write back and run again with no intervening mutation.
        let second = engine
            .start_sync(&first.synced_notes, &[], &remotes, &[])
            .unwrap();

        assert_eq!(first.synced_notes, second.synced_notes);
        assert_eq!(first.conflicts.len(), 1);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(first.conflicts[0].id, second.conflicts[0].id);
        assert_eq!(engine.registry().list_unresolved().len(), 1);
    }

    #[test]
    fn test_notebooks_reconciled_too() {
        let mut local = RevisionedItem::new_notebook(NotebookFields {
            name: "Inbox".to_string(),
            color: None,
            parent_id: None,
        });
        local.revision = Some(1);
        local.updated_at = BASE_TS;
        local.synced_at = Some(BASE_TS);
        let mut remote = remote_twin(&local);
        remote.fields = ItemFields::Notebook(NotebookFields {
            name: "Inbox (renamed)".to_string(),
            color: None,
            parent_id: None,
        });
        remote.updated_at = BASE_TS + 10;
        remote.revision = Some(2);

        let engine = engine();
        let outcome = engine
            .start_sync(&[], std::slice::from_ref(&local), &[], std::slice::from_ref(&remote))
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 0);
        assert_eq!(outcome.synced_notebooks[0].fields, remote.fields);
    }

    #[test]
    fn test_malformed_item_does_not_abort_pass() {
        let mut malformed = synced_note("Body", &[]);
        if let ItemFields::Note(fields) = &mut malformed.fields {
            fields.tags.insert("   ".to_string());
        }
        malformed.updated_at = BASE_TS + 5;
        let good = synced_note("Good", &[]);
        let good_remote = remote_twin(&good);

        let engine = engine();
        let outcome = engine
            .start_sync(
                &[malformed.clone(), good.clone()],
                &[],
                std::slice::from_ref(&good_remote),
                &[],
            )
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].reason, ConflictReason::MalformedItem);
        assert_eq!(outcome.conflicts[0].item_id, malformed.id);
        // The well-formed note still reconciled, and the malformed local
        // copy is preserved for inspection.
        assert_eq!(outcome.synced_notes.len(), 2);
    }

    #[test]
    fn test_manual_remote_wins_resolution() {
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "local edit", BASE_TS + 5);
        let mut remote = remote_twin(&base);
        edit_content(&mut remote, "remote edit", BASE_TS + 8);
        remote.revision = Some(4);

        let engine = engine();
        let outcome = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();
        let conflict = &outcome.conflicts[0];

        let resolved = engine
            .resolve_conflict_manually(conflict.id, &ConflictResolution::keep_remote())
            .unwrap();
        assert_eq!(resolved.fields, remote.fields);

        let entry = engine.registry().get(conflict.id).unwrap();
        assert!(entry.resolved);
        assert_eq!(entry.resolved_item.unwrap().fields, remote.fields);
    }

    #[test]
    fn test_state_after_completed_pass() {
        let engine = engine();
        let state = engine.get_sync_state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.last_sync, None);

        engine.start_sync(&[], &[], &[], &[]).unwrap();
        let state = engine.get_sync_state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.progress, 100);
        assert!(state.last_sync.is_some());
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_subscribers_notified_in_registration_order() {
        let engine = Arc::new(engine());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&order);
        engine.subscribe(move |state| {
            first_log.lock().unwrap().push(("first", state.status));
        });
        let second_log = Arc::clone(&order);
        let second = engine.subscribe(move |state| {
            second_log.lock().unwrap().push(("second", state.status));
        });

        engine.start_sync(&[], &[], &[], &[]).unwrap();
        {
            let calls = order.lock().unwrap();
            assert_eq!(
                *calls,
                vec![("first", SyncStatus::Idle), ("second", SyncStatus::Idle)]
            );
        }

        engine.unsubscribe(second);
        engine.start_sync(&[], &[], &[], &[]).unwrap();
        let calls = order.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, "first");
    }

    #[test]
    fn test_subscriber_may_reenter_engine_during_notification() {
        let engine = Arc::new(engine());
        let calls = Arc::new(AtomicUsize::new(0));

        // First subscriber unsubscribes another and reads state mid-delivery.
        let to_remove: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let reentrant = Arc::clone(&engine);
        let slot = Arc::clone(&to_remove);
        engine.subscribe(move |_| {
            let _ = reentrant.get_sync_state();
            if let Some(id) = slot.lock().unwrap().take() {
                reentrant.unsubscribe(id);
            }
        });
        let count = Arc::clone(&calls);
        let second = engine.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        *to_remove.lock().unwrap() = Some(second);

        // The removal lands mid-delivery; this publication's snapshot still
        // includes the second subscriber.
        engine.start_sync(&[], &[], &[], &[]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.start_sync(&[], &[], &[], &[]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_resolved_and_reset() {
        let base = synced_note("Body", &[]);
        let mut local = base.clone();
        edit_content(&mut local, "local edit", BASE_TS + 5);
        let mut remote = remote_twin(&base);
        edit_content(&mut remote, "remote edit", BASE_TS + 8);
        remote.revision = Some(4);

        let engine = engine();
        let outcome = engine
            .start_sync(
                std::slice::from_ref(&local),
                &[],
                std::slice::from_ref(&remote),
                &[],
            )
            .unwrap();
        engine
            .resolve_conflict_manually(outcome.conflicts[0].id, &ConflictResolution::keep_local())
            .unwrap();

        engine.clear_resolved_conflicts();
        assert!(engine.get_sync_state().conflicts.is_empty());

        engine.reset_sync_state();
        let state = engine.get_sync_state();
        assert_eq!(state, SyncState::default());
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_before_touching_state() {
        let local = synced_note("Body", &[]);
        let engine = engine();
        let notified = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&notified);
        engine.subscribe(move |state| {
            assert_eq!(state.status, SyncStatus::Error);
            count.fetch_add(1, Ordering::SeqCst);
        });

        let err = engine
            .sync_with(std::slice::from_ref(&local), &[], async {
                Err(Error::FetchFailed("network unreachable".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FetchFailed(_)));
        let state = engine.get_sync_state();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Remote fetch failed: network unreachable")
        );
        assert_eq!(state.last_sync, None);
        assert!(engine.registry().list().is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_fetch_runs_pass() {
        let local = synced_note("Body", &[]);
        let remote = remote_twin(&local);
        let engine = engine();

        let outcome = engine
            .sync_with(std::slice::from_ref(&local), &[], async move {
                Ok(RemoteSnapshot {
                    notes: vec![remote],
                    notebooks: Vec::new(),
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.synced_notes.len(), 1);
        assert_eq!(engine.get_sync_state().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_reentry_rejected_while_fetch_pending() {
        let engine = Arc::new(engine());
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let background = Arc::clone(&engine);
        let pending = tokio::spawn(async move {
            background
                .sync_with(&[], &[], async move {
                    gate.await.map_err(|_| Error::FetchFailed("gate dropped".to_string()))?;
                    Ok(RemoteSnapshot::default())
                })
                .await
        });

        // Let the background pass reach its fetch suspension point.
        tokio::task::yield_now().await;
        assert_eq!(engine.get_sync_state().status, SyncStatus::Syncing);

        let err = engine.start_sync(&[], &[], &[], &[]).unwrap_err();
        assert!(matches!(err, Error::SyncInProgress));

        release.send(()).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(engine.get_sync_state().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_restores_idle() {
        let engine = Arc::new(engine());

        // Never-resolving fetch; aborting the task drops the in-flight pass.
        let background = Arc::clone(&engine);
        let pending = tokio::spawn(async move {
            background.sync_with(&[], &[], std::future::pending()).await
        });
        tokio::task::yield_now().await;
        assert_eq!(engine.get_sync_state().status, SyncStatus::Syncing);

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let state = engine.get_sync_state();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.last_sync, None);
    }
}
