//! Synchronization engine: divergence detection, merge resolution, the
//! conflict registry, and the session controller that ties them together.

mod detect;
mod engine;
mod registry;
mod resolve;

pub use detect::{classify, Relation};
pub use engine::{RemoteSnapshot, SubscriptionId, SyncEngine, SyncOptions, SyncOutcome};
pub use registry::ConflictRegistry;
pub use resolve::{merge_items, resolve, MergeStrategy, Resolved};
