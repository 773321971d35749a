//! Iterator merge algorithms for the merge worker.
//!
//! [`MergingIterator`] produces one sorted stream out of N sorted inputs
//! using the temporal comparator, with a min-heap to pick the next smallest
//! key. Ties are broken by input order: earlier inputs win, and the merge
//! composition always lists newer sources first (memtable, then the stable
//! carry-forward, then unstable files by ascending slot).
//!
//! The merge does NOT deduplicate. startTime is part of the key, so a key
//! collision is a legitimate overwrite and downstream readers resolve the
//! winner by source order. The one writer that must dedupe, the stable
//! carry-forward during promotion, does so through
//! [`TableLatestValueIterator`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::key::{compare_keys, InternalKey};

/// A sorted stream of encoded (key, value) pairs.
pub type EntryIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse the key order so the smallest
        // key pops first, and on equal keys pop the lowest source index.
        match compare_keys(&self.key, &other.key) {
            Ordering::Equal => other.source_index.cmp(&self.source_index),
            ord => ord.reverse(),
        }
    }
}

/// N-way ordered merge over sorted iterators.
pub struct MergingIterator {
    sources: Vec<EntryIterator>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<Error>,
}

impl MergingIterator {
    pub fn new(sources: Vec<EntryIterator>) -> Self {
        let mut merged = Self {
            sources,
            heap: BinaryHeap::new(),
            pending_error: None,
        };
        for source_index in 0..merged.sources.len() {
            if let Err(e) = merged.advance(source_index) {
                merged.pending_error = Some(e);
                break;
            }
        }
        merged
    }

    /// Pulls the next entry from one source into the heap.
    fn advance(&mut self, source_index: usize) -> Result<()> {
        match self.sources[source_index].next() {
            Some(Ok((key, value))) => {
                self.heap.push(HeapEntry {
                    key,
                    value,
                    source_index,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        if let Err(e) = self.advance(entry.source_index) {
            return Some(Err(e));
        }
        Some(Ok((entry.key, entry.value)))
    }
}

/// Keeps only the newest record per (propertyId, entityId).
///
/// Within an entity the comparator orders startTime descending, so the first
/// record of each entity group is the newest; the rest are skipped. Used
/// during promotion to carry the latest stable value forward.
pub struct TableLatestValueIterator {
    source: EntryIterator,
    last_entity: Option<(u32, u64)>,
}

impl TableLatestValueIterator {
    pub fn new(source: EntryIterator) -> Self {
        Self {
            source,
            last_entity: None,
        }
    }
}

impl Iterator for TableLatestValueIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.source.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let decoded = match InternalKey::decode(&key) {
                Ok(decoded) => decoded,
                Err(e) => return Some(Err(e)),
            };
            let entity = (decoded.property_id, decoded.entity_id);
            if self.last_entity == Some(entity) {
                continue;
            }
            self.last_entity = Some(entity);
            return Some(Ok((key, value)));
        }
    }
}

/// Two-way ordered merge of a file's overlay buffer with the file itself.
///
/// The buffer holds later edits, so on equal keys the buffer entry is
/// yielded first; nothing is dropped.
pub struct BufferFileAndTableIterator {
    buffer: EntryIterator,
    table: EntryIterator,
    buffer_next: Option<(Vec<u8>, Vec<u8>)>,
    table_next: Option<(Vec<u8>, Vec<u8>)>,
}

impl BufferFileAndTableIterator {
    pub fn new(buffer: EntryIterator, table: EntryIterator) -> Self {
        Self {
            buffer,
            table,
            buffer_next: None,
            table_next: None,
        }
    }

    fn fill(&mut self) -> Result<()> {
        if self.buffer_next.is_none() {
            if let Some(entry) = self.buffer.next() {
                self.buffer_next = Some(entry?);
            }
        }
        if self.table_next.is_none() {
            if let Some(entry) = self.table.next() {
                self.table_next = Some(entry?);
            }
        }
        Ok(())
    }
}

impl Iterator for BufferFileAndTableIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            return Some(Err(e));
        }
        match (&self.buffer_next, &self.table_next) {
            (None, None) => None,
            (Some(_), None) => self.buffer_next.take().map(Ok),
            (None, Some(_)) => self.table_next.take().map(Ok),
            (Some((bk, _)), Some((tk, _))) => match compare_keys(bk, tk) {
                Ordering::Greater => self.table_next.take().map(Ok),
                _ => self.buffer_next.take().map(Ok),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::InternalKey;

    fn source(entries: Vec<(InternalKey, &'static str)>) -> EntryIterator {
        Box::new(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k.encode(), v.as_bytes().to_vec()))),
        )
    }

    fn drain(iter: impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>>) -> Vec<(InternalKey, String)> {
        iter.map(|entry| {
            let (k, v) = entry.unwrap();
            (
                InternalKey::decode(&k).unwrap(),
                String::from_utf8(v).unwrap(),
            )
        })
        .collect()
    }

    #[test]
    fn test_merge_orders_across_sources() {
        let merged = MergingIterator::new(vec![
            source(vec![
                (InternalKey::new(1, 1, 50), "a"),
                (InternalKey::new(1, 3, 10), "c"),
            ]),
            source(vec![
                (InternalKey::new(1, 1, 20), "b"),
                (InternalKey::new(2, 1, 10), "d"),
            ]),
        ]);
        let out = drain(merged);
        assert_eq!(
            out,
            vec![
                (InternalKey::new(1, 1, 50), "a".into()),
                (InternalKey::new(1, 1, 20), "b".into()),
                (InternalKey::new(1, 3, 10), "c".into()),
                (InternalKey::new(2, 1, 10), "d".into()),
            ]
        );
    }

    #[test]
    fn test_merge_keeps_duplicates_in_source_order() {
        let key = InternalKey::new(1, 7, 10);
        let merged = MergingIterator::new(vec![
            source(vec![(key, "newest")]),
            source(vec![(key, "middle")]),
            source(vec![(key, "oldest")]),
        ]);
        let out = drain(merged);
        assert_eq!(
            out,
            vec![
                (key, "newest".into()),
                (key, "middle".into()),
                (key, "oldest".into()),
            ]
        );
    }

    #[test]
    fn test_merge_empty_sources() {
        let merged = MergingIterator::new(vec![source(vec![]), source(vec![])]);
        assert!(drain(merged).is_empty());
    }

    #[test]
    fn test_latest_value_keeps_newest_per_entity() {
        let latest = TableLatestValueIterator::new(source(vec![
            (InternalKey::new(1, 1, 30), "e1-new"),
            (InternalKey::new(1, 1, 20), "e1-mid"),
            (InternalKey::new(1, 1, 10), "e1-old"),
            (InternalKey::new(1, 2, 5), "e2-only"),
            (InternalKey::new(2, 1, 9), "p2-new"),
            (InternalKey::new(2, 1, 3), "p2-old"),
        ]));
        let out = drain(latest);
        assert_eq!(
            out,
            vec![
                (InternalKey::new(1, 1, 30), "e1-new".into()),
                (InternalKey::new(1, 2, 5), "e2-only".into()),
                (InternalKey::new(2, 1, 9), "p2-new".into()),
            ]
        );
    }

    #[test]
    fn test_buffer_wins_ties_without_dropping() {
        let merged = BufferFileAndTableIterator::new(
            source(vec![
                (InternalKey::new(1, 1, 20), "buf-edit"),
                (InternalKey::new(1, 2, 10), "buf-only"),
            ]),
            source(vec![
                (InternalKey::new(1, 1, 20), "file-orig"),
                (InternalKey::new(1, 3, 10), "file-only"),
            ]),
        );
        let out = drain(merged);
        assert_eq!(
            out,
            vec![
                (InternalKey::new(1, 1, 20), "buf-edit".into()),
                (InternalKey::new(1, 1, 20), "file-orig".into()),
                (InternalKey::new(1, 2, 10), "buf-only".into()),
                (InternalKey::new(1, 3, 10), "file-only".into()),
            ]
        );
    }
}
