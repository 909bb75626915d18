//! Paging parameters for the store's bulk reads.

use serde::{Deserialize, Serialize};

/// Limit/offset window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Number of events to skip (0-based).
    pub offset: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: u32, offset: u64) -> Self {
        Self { limit, offset }
    }

    /// Apply the window to an already ordered iterator.
    pub fn slice<T>(self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}
