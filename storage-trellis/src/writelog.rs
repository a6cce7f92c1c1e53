use serde::{Deserialize, Serialize};

use crate::node::{Hash, LeafNode};

/// A single key mutation; `None` is a tombstone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn insert(key: Vec<u8>, value: Vec<u8>) -> Self {
        LogEntry {
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        LogEntry { key, value: None }
    }
}

/// Ordered sequence of mutations leading from one root to another.
pub type WriteLog = Vec<LogEntry>;

/// Persisted form of a write log. Inserts are stored as the hash of the
/// leaf node holding the value so the log shares storage with the tree;
/// tombstones carry no hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashedLogEntry {
    pub key: Vec<u8>,
    pub leaf_hash: Option<Hash>,
}

/// Build the persisted form from a write log. `annotations` carries, per
/// entry, the hash of the leaf holding the written value (None for
/// tombstones) as produced by the tree commit.
pub fn into_hashed(log: &WriteLog, annotations: &[Option<Hash>]) -> Vec<HashedLogEntry> {
    log.iter()
        .zip(annotations.iter())
        .map(|(entry, leaf)| HashedLogEntry {
            key: entry.key.clone(),
            leaf_hash: *leaf,
        })
        .collect()
}

/// Annotate a write log by computing the leaf hash each insert produces.
/// The leaf hash depends only on (key, value), so no tree walk is needed.
pub fn annotate(log: &WriteLog) -> Vec<Option<Hash>> {
    log.iter()
        .map(|entry| {
            entry
                .value
                .as_ref()
                .map(|value| LeafNode::new(entry.key.clone(), value.clone()).hash)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_follow_tombstones() {
        let log = vec![
            LogEntry::insert(b"a".to_vec(), b"1".to_vec()),
            LogEntry::tombstone(b"b".to_vec()),
        ];
        let notes = annotate(&log);
        assert!(notes[0].is_some());
        assert!(notes[1].is_none());

        let hashed = into_hashed(&log, &notes);
        assert_eq!(hashed.len(), 2);
        assert_eq!(hashed[0].leaf_hash, notes[0]);
        assert_eq!(hashed[1].leaf_hash, None);
    }

    #[test]
    fn leaf_hash_is_content_addressed() {
        let log = vec![LogEntry::insert(b"k".to_vec(), b"v".to_vec())];
        let a = annotate(&log);
        let b = annotate(&log);
        assert_eq!(a, b);
        assert_eq!(
            a[0].unwrap(),
            LeafNode::new(b"k".to_vec(), b"v".to_vec()).hash
        );
    }
}
