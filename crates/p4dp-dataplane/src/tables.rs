//! Lookup table seam
//!
//! The classification structure behind each table id (hash, LPM trie,
//! ternary) is produced by the P4 backend. The runtime only needs to build a
//! replica from control-plane contents and query it.

use std::collections::HashMap;
use std::fmt::Display;

/// A buildable, read-only classification table
pub trait LookupTable: Send + Sync + Sized + 'static {
    /// Lookup key
    type Key: ?Sized;
    /// Action data returned on a hit
    type Value: Clone;
    /// Control-plane description of the table contents
    type Contents;
    /// Build failure reason
    type Error: Display;

    /// Construct a complete replica from `contents`
    fn build(contents: Self::Contents) -> Result<Self, Self::Error>;

    /// Query the replica
    fn get(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Number of entries
    fn len(&self) -> usize;

    /// Check if empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contents of an exact-match table
#[derive(Debug, Clone)]
pub struct ExactMatchContents<V> {
    /// Width of every key in bytes
    pub key_len: usize,
    /// Key/action-data pairs
    pub entries: Vec<(Vec<u8>, V)>,
}

impl<V> ExactMatchContents<V> {
    /// Create contents with fixed key width
    pub fn new(key_len: usize) -> Self {
        Self {
            key_len,
            entries: Vec::new(),
        }
    }

    /// Add an entry
    pub fn with_entry(mut self, key: impl Into<Vec<u8>>, value: V) -> Self {
        self.entries.push((key.into(), value));
        self
    }
}

/// Exact-match build errors
#[derive(Debug, thiserror::Error)]
pub enum TableBuildError {
    /// Key width differs from the table's
    #[error("entry {index} has a {got}-byte key, table expects {expected}")]
    KeyWidth {
        /// Entry position
        index: usize,
        /// Width of the offending key
        got: usize,
        /// Table key width
        expected: usize,
    },
    /// Duplicate key at this entry position
    #[error("entry {0} repeats an earlier key")]
    DuplicateKey(usize),
}

/// Exact-match table over fixed-width byte keys
#[derive(Debug)]
pub struct ExactMatchTable<V> {
    key_len: usize,
    entries: HashMap<Vec<u8>, V>,
}

impl<V> LookupTable for ExactMatchTable<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Key = [u8];
    type Value = V;
    type Contents = ExactMatchContents<V>;
    type Error = TableBuildError;

    fn build(contents: Self::Contents) -> Result<Self, Self::Error> {
        let mut entries = HashMap::with_capacity(contents.entries.len());
        for (index, (key, value)) in contents.entries.into_iter().enumerate() {
            if key.len() != contents.key_len {
                return Err(TableBuildError::KeyWidth {
                    index,
                    got: key.len(),
                    expected: contents.key_len,
                });
            }
            if entries.insert(key, value).is_some() {
                return Err(TableBuildError::DuplicateKey(index));
            }
        }
        Ok(Self {
            key_len: contents.key_len,
            entries,
        })
    }

    #[inline]
    fn get(&self, key: &[u8]) -> Option<V> {
        if key.len() != self.key_len {
            return None;
        }
        self.entries.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_get() {
        let contents = ExactMatchContents::new(4)
            .with_entry([10, 0, 0, 1], 1u16)
            .with_entry([10, 0, 0, 2], 2u16);
        let table = ExactMatchTable::build(contents).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&[10, 0, 0, 2]), Some(2));
        assert_eq!(table.get(&[10, 0, 0, 3]), None);
        assert_eq!(table.get(&[10, 0]), None);
    }

    #[test]
    fn test_build_rejects_bad_width() {
        let contents = ExactMatchContents::new(4).with_entry([1, 2, 3], 0u8);
        let err = ExactMatchTable::build(contents).unwrap_err();
        assert!(matches!(err, TableBuildError::KeyWidth { index: 0, got: 3, expected: 4 }));
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let contents = ExactMatchContents::new(1)
            .with_entry([7], 0u8)
            .with_entry([7], 1u8);
        assert!(matches!(
            ExactMatchTable::build(contents),
            Err(TableBuildError::DuplicateKey(1))
        ));
    }
}
