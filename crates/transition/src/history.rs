//! Rollback history of committed environments.

use worldswap_common::EnvironmentId;

/// LIFO record of environments that were swapped away from.
///
/// Unbounded unless built with [`with_max_depth`](Self::with_max_depth), in
/// which case the oldest entry is evicted first.
#[derive(Debug, Clone, Default)]
pub struct HistoryStack {
    entries: Vec<EnvironmentId>,
    max_depth: Option<usize>,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_depth: Some(max_depth.max(1)),
        }
    }

    /// Rebuild from persisted entries, oldest first. Entries are kept verbatim.
    pub fn from_entries(entries: Vec<EnvironmentId>) -> Self {
        Self {
            entries,
            max_depth: None,
        }
    }

    /// Like [`from_entries`](Self::from_entries), keeping only the newest
    /// `max_depth` entries.
    pub fn from_entries_bounded(entries: Vec<EnvironmentId>, max_depth: usize) -> Self {
        let mut stack = Self {
            entries,
            max_depth: Some(max_depth.max(1)),
        };
        stack.evict();
        stack
    }

    /// Push `previous` unless it is absent, blank, or already on top.
    /// Returns whether the stack grew.
    pub fn push_if_changed(&mut self, previous: Option<&EnvironmentId>) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if previous.is_empty() || self.entries.last() == Some(previous) {
            return false;
        }
        self.entries.push(previous.clone());
        self.evict();
        true
    }

    fn evict(&mut self) {
        if let Some(max) = self.max_depth {
            if self.entries.len() > max {
                let excess = self.entries.len() - max;
                self.entries.drain(..excess);
            }
        }
    }

    pub fn pop(&mut self) -> Option<EnvironmentId> {
        self.entries.pop()
    }

    pub fn peek(&self) -> Option<&EnvironmentId> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first.
    pub fn entries(&self) -> &[EnvironmentId] {
        &self.entries
    }
}
