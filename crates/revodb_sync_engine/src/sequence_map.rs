//! Out-of-order sequence checkpointing.

use std::collections::BTreeMap;

/// Tracks in-flight local sequence tokens mapped to opaque remote sequence
/// identifiers, and computes the newest remote sequence that is safe to
/// checkpoint.
///
/// Local sequences are handed out in strictly increasing order but resolve
/// in arbitrary order as fetches and inserts complete. The checkpointed
/// value only ever advances over a contiguous resolved prefix, so the
/// persisted checkpoint can never pass work that has not been durably
/// applied.
#[derive(Debug, Default)]
pub struct SequenceMap {
    /// Unresolved and resolved-but-not-yet-collapsed entries.
    entries: BTreeMap<u64, Entry>,
    /// Last allocated local sequence.
    last_sequence: u64,
    /// Remote value of the newest collapsed entry.
    checkpointed: Option<String>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    resolved: bool,
}

impl SequenceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new local sequence for a remote sequence value.
    pub fn add_value(&mut self, value: impl Into<String>) -> u64 {
        self.last_sequence += 1;
        self.entries.insert(
            self.last_sequence,
            Entry {
                value: value.into(),
                resolved: false,
            },
        );
        self.last_sequence
    }

    /// Marks a previously allocated local sequence as durably applied.
    ///
    /// Unknown sequences are ignored.
    pub fn remove_sequence(&mut self, sequence: u64) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            entry.resolved = true;
        }
    }

    /// The remote sequence corresponding to the highest-numbered contiguous
    /// resolved prefix, or `None` if nothing has resolved yet.
    pub fn checkpointed_value(&mut self) -> Option<String> {
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().resolved {
                break;
            }
            self.checkpointed = Some(entry.remove().value);
        }
        self.checkpointed.clone()
    }

    /// True if no allocated sequence is still unresolved.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|entry| entry.resolved)
    }

    /// Number of allocated sequences not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|entry| !entry.resolved).count()
    }
}
