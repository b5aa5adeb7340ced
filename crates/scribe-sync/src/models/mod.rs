//! Data models for the sync engine

mod conflict;
mod item;
mod state;

pub use conflict::{ConflictId, ConflictReason, ConflictResolution, ResolutionStrategy, SyncConflict};
pub use item::{ItemFields, ItemId, ItemKind, NoteFields, NotebookFields, RevisionedItem};
pub use state::{SyncState, SyncStatus};
