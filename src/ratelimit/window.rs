//! Window entries and window arithmetic.

use uuid::Uuid;

/// One admitted request recorded in a window.
///
/// The score is the admission time and drives eviction. The member is unique
/// per request so that two admissions in the same millisecond stay two
/// entries instead of collapsing into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    /// Unique member identity within the key's collection
    pub member: String,
    /// Admission time in epoch milliseconds
    pub score: i64,
}

impl WindowEntry {
    /// Create an entry admitted at `now_millis`.
    pub fn new(now_millis: i64) -> Self {
        Self {
            member: format!("{}-{}", now_millis, Uuid::new_v4().simple()),
            score: now_millis,
        }
    }
}

/// Lower bound of the window that ends at `now_millis`.
///
/// Entries scored at or below this value no longer count.
pub fn window_start(now_millis: i64, window_millis: i64) -> i64 {
    now_millis.saturating_sub(window_millis)
}
