//! Shared utility functions used across multiple modules.

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a tag for comparison and storage.
///
/// Tags are trimmed and lowercased so that `Urgent` and `urgent` merge to
/// a single entry during tag-set union.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
