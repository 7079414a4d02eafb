//! The Raft log: a 1-indexed sequence of commands replicated across nodes and
//! applied in order to each node's state machine. Index 0 holds a zero
//! sentinel entry so that "previous entry" lookups are always well-defined.
//!
//! The log also owns the node's persistent term and vote, since all three
//! share the durable store and must be flushed together. The commit index is
//! deliberately volatile: it is recoverable from a log quorum after a
//! restart, so persisting it would buy nothing.
//!
//! Invariants:
//!
//! * Entry indexes are contiguous starting at 0 (the sentinel).
//! * Entry terms never decrease from the previous entry, and never exceed the
//!   current term.
//! * Every mutation of the term, vote, or entries is flushed to the store
//!   before the mutating call returns.
//! * Committed entries are never truncated or replaced.

use serde_derive::{Deserialize, Serialize};

use super::{NodeID, Term};
use crate::error::Result;
use crate::storage::Store;

/// A log entry index. The sentinel occupies index 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The state machine command. Empty for the sentinel.
    pub command: Vec<u8>,
}

/// The Raft log. All entries are kept in memory; the store holds the durable
/// copy that restores them on startup.
pub struct Log {
    /// The durable store.
    store: Box<dyn Store>,
    /// All log entries, including the sentinel at index 0.
    entries: Vec<Entry>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last committed entry. Volatile.
    commit_index: Index,
}

impl Log {
    /// Opens the log, restoring any persisted state from the store. An empty
    /// store initializes with the sentinel entry.
    pub fn new(mut store: Box<dyn Store>) -> Result<Self> {
        let (term, vote, mut entries) = store.restore()?.unwrap_or_default();
        if entries.is_empty() {
            entries.push(Entry { index: 0, term: 0, command: Vec::new() });
        }
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, i as Index, "restored entry index mismatch");
            assert!(entry.term <= term, "restored entry term beyond current term");
        }
        Ok(Self { store, entries, term, vote, commit_index: 0 })
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.store.persist(term, vote, &self.entries, None)?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Returns the last log index and its term.
    pub fn last(&self) -> (Index, Term) {
        let entry = self.entries.last().expect("log without sentinel");
        (entry.index, entry.term)
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Marks entries up to and including the given index as committed. The
    /// index must exist and can't regress.
    pub fn commit(&mut self, index: Index) {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        assert!(index <= self.last().0, "can't commit non-existent index {index}");
        self.commit_index = index;
    }

    /// Appends a command to the log at the current term and flushes it to the
    /// store, returning its index.
    pub fn append(&mut self, command: Vec<u8>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let index = self.entries.len() as Index;
        self.entries.push(Entry { index, term: self.term, command });
        self.store.persist(self.term, self.vote, &self.entries, Some(index as usize))?;
        Ok(index)
    }

    /// Fetches the entry at an index, if it exists.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks if the log contains an entry with the given index and term. The
    /// sentinel matches (0, 0).
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|entry| entry.term == term).unwrap_or(false)
    }

    /// Returns all entries at or after the given index.
    pub fn entries_from(&self, index: Index) -> &[Entry] {
        self.entries.get(index as usize..).unwrap_or(&[])
    }

    /// Splices entries from a leader into the log and flushes the result to
    /// the store. The entries must be contiguous, with the first connecting
    /// to an existing entry. Entries already present with the same term are
    /// skipped; the first conflicting entry truncates the rest of the log
    /// before the remainder is appended. Returns the last log index.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last().0); // empty input is a noop
        };

        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(first.index <= self.entries.len() as Index, "splice disconnected from log");
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );

        // Skip entries that are already in the log. The first term mismatch,
        // if any, is the conflict point.
        let mut entries = entries.as_slice();
        while let Some(entry) = entries.first() {
            match self.get(entry.index) {
                Some(have) if have.term == entry.term => {
                    assert_eq!(have.command, entry.command, "command mismatch at {entry:?}");
                    entries = &entries[1..];
                }
                _ => break,
            }
        }
        let Some(first) = entries.first() else {
            return Ok(self.last().0);
        };

        // Truncate any conflicting tail, append the remainder, and persist
        // from the splice point. Committed entries must be immutable.
        assert!(first.index > self.commit_index, "splice below commit index {}", self.commit_index);
        let at = first.index as usize;
        self.entries.truncate(at);
        self.entries.extend(entries.iter().cloned());
        self.store.persist(self.term, self.vote, &self.entries, Some(at))?;
        Ok(self.last().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    fn entry(index: Index, term: Term, command: &[u8]) -> Entry {
        Entry { index, term, command: command.to_vec() }
    }

    fn setup() -> Log {
        Log::new(Box::new(Memory::new())).expect("log failed")
    }

    #[test]
    fn new_initializes_sentinel() {
        let log = setup();
        assert_eq!(log.get_term(), (0, None));
        assert_eq!(log.last(), (0, 0));
        assert_eq!(log.commit_index(), 0);
        assert_eq!(log.get(0), Some(&entry(0, 0, b"")));
        assert!(log.has(0, 0));
    }

    #[test]
    fn append_assigns_indexes_and_terms() -> Result<()> {
        let mut log = setup();
        log.set_term(1, Some(1))?;
        assert_eq!(log.append(b"a".to_vec())?, 1);
        assert_eq!(log.append(b"b".to_vec())?, 2);
        log.set_term(2, None)?;
        assert_eq!(log.append(b"c".to_vec())?, 3);

        assert_eq!(log.last(), (3, 2));
        assert_eq!(log.get(2), Some(&entry(2, 1, b"b")));
        assert!(log.has(3, 2));
        assert!(!log.has(3, 1));
        assert!(!log.has(4, 2));
        Ok(())
    }

    /// Term, vote, and entries survive a store reopen; the commit index is
    /// volatile and resets.
    #[test]
    fn reopen_restores_persistent_state() -> Result<()> {
        let store = Memory::new();
        let mut log = Log::new(Box::new(store.clone()))?;
        log.set_term(2, Some(3))?;
        log.append(b"a".to_vec())?;
        log.append(b"b".to_vec())?;
        log.commit(1);
        drop(log);

        let log = Log::new(Box::new(store))?;
        assert_eq!(log.get_term(), (2, Some(3)));
        assert_eq!(log.last(), (2, 2));
        assert_eq!(log.entries_from(1), &[entry(1, 2, b"a"), entry(2, 2, b"b")]);
        assert_eq!(log.commit_index(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_cannot_change_vote() {
        let mut log = setup();
        log.set_term(1, Some(1)).unwrap();
        log.set_term(1, Some(2)).unwrap();
    }

    #[test]
    fn splice_extends_log() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        assert_eq!(log.last(), (2, 1));
        assert_eq!(log.entries_from(1), &[entry(1, 1, b"a"), entry(2, 1, b"b")]);
        Ok(())
    }

    /// Re-sent entries that match the log are skipped without truncating the
    /// tail beyond them.
    #[test]
    fn splice_skips_matching_entries() -> Result<()> {
        let mut log = setup();
        log.set_term(1, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        assert_eq!(log.last(), (3, 1));
        Ok(())
    }

    /// A conflicting entry truncates the old tail and replaces it, even when
    /// the new log ends up shorter.
    #[test]
    fn splice_truncates_conflicting_tail() -> Result<()> {
        let store = Memory::new();
        let mut log = Log::new(Box::new(store.clone()))?;
        log.set_term(1, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])?;
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, b"a"), entry(2, 2, b"x")])?;

        assert_eq!(log.last(), (2, 2));
        assert_eq!(log.entries_from(1), &[entry(1, 1, b"a"), entry(2, 2, b"x")]);

        // The replacement is durable.
        drop(log);
        let log = Log::new(Box::new(store))?;
        assert_eq!(log.entries_from(1), &[entry(1, 1, b"a"), entry(2, 2, b"x")]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "splice below commit index")]
    fn splice_cannot_replace_committed_entries() {
        let mut log = setup();
        log.set_term(1, None).unwrap();
        log.splice(vec![entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
        log.commit(2);
        log.set_term(2, None).unwrap();
        log.splice(vec![entry(2, 2, b"x")]).unwrap();
    }

    #[test]
    #[should_panic(expected = "can't commit non-existent index")]
    fn commit_requires_existing_entry() {
        let mut log = setup();
        log.commit(1);
    }
}
