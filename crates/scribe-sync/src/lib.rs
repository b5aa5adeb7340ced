//! scribe-sync - Synchronization and conflict resolution for Scribe
//!
//! Reconciles a local note collection against a remote snapshot: detects
//! divergent edits, merges what is safe to merge, and surfaces the rest as
//! conflicts for the user to resolve. The engine owns no persistence or
//! transport; callers hand it collections and write the results back.

pub mod error;
pub mod models;
pub mod sync;
mod util;

pub use error::{Error, Result};
pub use models::{
    ConflictId, ConflictReason, ConflictResolution, ItemFields, ItemId, ItemKind, NoteFields,
    NotebookFields, ResolutionStrategy, RevisionedItem, SyncConflict, SyncState, SyncStatus,
};
pub use sync::{MergeStrategy, RemoteSnapshot, SyncEngine, SyncOptions, SyncOutcome};
