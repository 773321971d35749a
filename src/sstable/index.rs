//! Sparse index over the data blocks of a sorted table.
//!
//! One entry per data block: the block's last key plus its (offset, length)
//! handle. Because entries carry the *last* key, the block that may contain a
//! target key is the first entry whose key is >= the target in comparator
//! order.

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::compare_keys;

/// Handle to one data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    /// `(last_key, handle)` per data block, in file order.
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, last_key: Vec<u8>, offset: u64, length: u64) {
        self.entries.push((last_key, BlockHandle { offset, length }));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All block handles in file order.
    pub fn handles(&self) -> Vec<BlockHandle> {
        self.entries.iter().map(|(_, handle)| *handle).collect()
    }

    /// Finds the block that may contain `key`: the first entry whose last
    /// key is >= `key`. Returns None when `key` sorts after every block.
    pub fn find(&self, key: &[u8]) -> Option<BlockHandle> {
        let mut low = 0;
        let mut high = self.entries.len();
        while low < high {
            let mid = low + (high - low) / 2;
            match compare_keys(&self.entries[mid].0, key) {
                Ordering::Less => low = mid + 1,
                _ => high = mid,
            }
        }
        self.entries.get(low).map(|(_, handle)| *handle)
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buffer);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buffer.len() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::Decode("key length in index block", e))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Decode("key in index block", e))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block offset in index block", e))?;

            let length = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block length in index block", e))?;

            entries.push((key, BlockHandle { offset, length }));
        }
        Ok(Self { entries })
    }
}

impl TryFrom<&Index> for Vec<u8> {
    type Error = Error;

    fn try_from(index: &Index) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for (key, handle) in &index.entries {
            buffer.write_u16::<BigEndian>(key.len() as u16)?;
            buffer.write_all(key)?;
            buffer.write_u64::<BigEndian>(handle.offset)?;
            buffer.write_u64::<BigEndian>(handle.length)?;
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::InternalKey;

    fn create_test_index() -> Index {
        let mut index = Index::new();
        // Last keys of three blocks, in comparator order.
        index.push(InternalKey::new(1, 5, 10).encode(), 0, 100);
        index.push(InternalKey::new(1, 9, 40).encode(), 100, 100);
        index.push(InternalKey::new(2, 3, 0).encode(), 200, 120);
        index
    }

    #[test]
    fn test_find_exact_last_key() {
        let index = create_test_index();
        let handle = index.find(&InternalKey::new(1, 9, 40).encode()).unwrap();
        assert_eq!(handle.offset, 100);
    }

    #[test]
    fn test_find_between_blocks() {
        let index = create_test_index();
        // (1,7,*) sorts after block 0's last key and before block 1's.
        let handle = index.find(&InternalKey::new(1, 7, 99).encode()).unwrap();
        assert_eq!(handle.offset, 100);
    }

    #[test]
    fn test_find_before_all() {
        let index = create_test_index();
        let handle = index.find(&InternalKey::new(0, 0, 0).encode()).unwrap();
        assert_eq!(handle.offset, 0);
    }

    #[test]
    fn test_find_after_all() {
        let index = create_test_index();
        assert!(index.find(&InternalKey::new(9, 9, 9).encode()).is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let original = create_test_index();
        let buffer: Vec<u8> = (&original).try_into().unwrap();
        let decoded = Index::try_from(buffer.as_slice()).unwrap();
        assert_eq!(original.entries, decoded.entries);
    }

    #[test]
    fn test_empty_serialization_roundtrip() {
        let original = Index::new();
        let buffer: Vec<u8> = (&original).try_into().unwrap();
        let decoded = Index::try_from(buffer.as_slice()).unwrap();
        assert!(decoded.is_empty());
    }
}
