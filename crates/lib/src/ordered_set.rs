//! A list of strings where each value appears at most once.

use std::collections::HashSet;

/// An insertion-ordered set of strings (MIME types in practice).
#[derive(Debug, Default, Clone)]
pub(crate) struct OrderedSet {
    list: Vec<String>,
    included: HashSet<String>,
}

impl OrderedSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add `s` at the end, unless it is already present.
    pub(crate) fn append(&mut self, s: &str) {
        if self.included.insert(s.to_owned()) {
            self.list.push(s.to_owned());
        }
    }

    /// The values, in insertion order.
    pub(crate) fn contents(&self) -> &[String] {
        &self.list
    }

    pub(crate) fn into_vec(self) -> Vec<String> {
        self.list
    }
}
