//! In-memory write buffer over a concurrent skip list.
//!
//! The memtable is filled by the write path and handed to the merge worker
//! whole. The worker treats it as read-only: it partitions the entries by
//! property and streams each partition into a merge. `crossbeam-skiplist`
//! keeps insertion lock-free and iteration in comparator order, which is
//! exactly the order the block builder requires.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::key::InternalKey;

/// Ordered in-memory map from internal key to value bytes.
#[derive(Debug, Default)]
pub struct MemTable {
    data: SkipMap<InternalKey, Vec<u8>>,
    size: AtomicUsize,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts a key-value pair. Duplicate startTime writes for the same
    /// property and entity overwrite in memory; distinct startTimes coexist
    /// as separate versions.
    pub fn add(&self, key: InternalKey, value: Vec<u8>) {
        let entry_size = crate::key::ENCODED_LEN + value.len();
        self.data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Approximate memory footprint in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Forward iteration in comparator order (property asc, entity asc,
    /// startTime desc).
    pub fn iter(&self) -> impl Iterator<Item = (InternalKey, Vec<u8>)> + '_ {
        self.data
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_iterate_in_order() {
        let mem = MemTable::new();
        mem.add(InternalKey::new(2, 1, 10), b"c".to_vec());
        mem.add(InternalKey::new(1, 7, 10), b"b".to_vec());
        mem.add(InternalKey::new(1, 7, 50), b"a".to_vec());

        let keys: Vec<InternalKey> = mem.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                InternalKey::new(1, 7, 50),
                InternalKey::new(1, 7, 10),
                InternalKey::new(2, 1, 10),
            ]
        );
    }

    #[test]
    fn test_empty_and_size() {
        let mem = MemTable::new();
        assert!(mem.is_empty());
        assert_eq!(mem.size(), 0);

        mem.add(InternalKey::new(1, 1, 1), b"xyz".to_vec());
        assert!(!mem.is_empty());
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.size(), crate::key::ENCODED_LEN + 3);
    }

    #[test]
    fn test_same_version_overwrites() {
        let mem = MemTable::new();
        let key = InternalKey::new(1, 7, 10);
        mem.add(key, b"old".to_vec());
        mem.add(key, b"new".to_vec());

        let entries: Vec<(InternalKey, Vec<u8>)> = mem.iter().collect();
        assert_eq!(entries, vec![(key, b"new".to_vec())]);
    }
}
