//! Revisioned item model shared by notes and notebooks

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::now_ms;

/// A unique identifier for a synced item, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Create a new unique item ID using UUID v7
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

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of item participating in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Note,
    Notebook,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Note => write!(f, "note"),
            Self::Notebook => write!(f, "notebook"),
        }
    }
}

/// Domain fields of a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteFields {
    /// Note title; may be empty for untitled notes
    pub title: String,
    /// Free-text markdown body; never auto-merged on conflict
    pub content: String,
    /// Tag set (stored lowercase, deduplicated)
    pub tags: BTreeSet<String>,
    /// Owning notebook, if any
    pub notebook_id: Option<ItemId>,
}

/// Domain fields of a notebook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookFields {
    /// Notebook display name
    pub name: String,
    /// Optional display color
    pub color: Option<String>,
    /// Parent notebook in the tree, if nested
    pub parent_id: Option<ItemId>,
}

/// Domain payload of a revisioned item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemFields {
    Note(NoteFields),
    Notebook(NotebookFields),
}

impl ItemFields {
    /// Kind of item these fields belong to
    #[must_use]
    pub const fn kind(&self) -> ItemKind {
        match self {
            Self::Note(_) => ItemKind::Note,
            Self::Notebook(_) => ItemKind::Notebook,
        }
    }
}

/// An item as both replicas see it: domain fields plus the sync markers
/// used to order edits and detect divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionedItem {
    /// Unique identifier, immutable for the item's lifetime
    pub id: ItemId,
    /// Monotonic per-item revision counter.
    ///
    /// On a local copy this is the remote revision the copy was last synced
    /// against (the common base); on a remote snapshot it is the remote's
    /// current counter. `None` on items that have never been synced.
    pub revision: Option<u64>,
    /// Last mutation timestamp (Unix ms)
    pub updated_at: i64,
    /// Timestamp of the last sync pass that confirmed this copy's content
    /// against the remote (Unix ms); `None` on items created locally and
    /// never confirmed. Local edits the remote has not received leave this
    /// untouched, so the copy keeps reading as changed.
    pub synced_at: Option<i64>,
    /// Soft delete flag; deletions are tombstones until both sides agree
    pub is_deleted: bool,
    /// Domain fields (opaque to sync except where merge rules apply)
    pub fields: ItemFields,
}

impl RevisionedItem {
    /// Create a new, never-synced note
    #[must_use]
    pub fn new_note(fields: NoteFields) -> Self {
        Self {
            id: ItemId::new(),
            revision: None,
            updated_at: now_ms(),
            synced_at: None,
            is_deleted: false,
            fields: ItemFields::Note(fields),
        }
    }

    /// Create a new, never-synced notebook
    #[must_use]
    pub fn new_notebook(fields: NotebookFields) -> Self {
        Self {
            id: ItemId::new(),
            revision: None,
            updated_at: now_ms(),
            synced_at: None,
            is_deleted: false,
            fields: ItemFields::Notebook(fields),
        }
    }

    /// Kind of this item
    #[must_use]
    pub const fn kind(&self) -> ItemKind {
        self.fields.kind()
    }

    /// Whether this copy changed since its last sync.
    ///
    /// An item that was never synced counts as changed.
    #[must_use]
    pub fn changed_since_sync(&self) -> bool {
        self.synced_at.is_none_or(|synced| self.updated_at > synced)
    }

    /// Structural sanity check, used to isolate malformed items to a
    /// per-item conflict instead of aborting a whole pass.
    pub fn validate(&self) -> Result<()> {
        if self.updated_at <= 0 {
            return Err(Error::InvalidInput(format!(
                "item {} has non-positive updated_at {}",
                self.id, self.updated_at
            )));
        }
        match &self.fields {
            ItemFields::Note(note) => {
                if note.tags.iter().any(|tag| tag.trim().is_empty()) {
                    return Err(Error::InvalidInput(format!(
                        "note {} has a blank tag",
                        self.id
                    )));
                }
            }
            ItemFields::Notebook(notebook) => {
                if notebook.name.trim().is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "notebook {} has a blank name",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}
