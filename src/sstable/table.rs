//! Sorted table files: building and reading.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (24 bytes) |
//! +-------------------+
//! ```
//!
//! The footer holds the index block's offset and length plus a magic number.
//! The index block has one entry per data block keyed by that block's last
//! key, so a lookup touches the footer, the index and a single data block.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::block::{self, Block, BlockIterator};
use super::index::{BlockHandle, Index};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::key::compare_keys;

pub const FOOTER_SIZE: u64 = 24;
const MAGIC: u64 = 0x6368_726f_6e6f_7462; // "chronotb"

/// Streams globally sorted (key, value) pairs into a complete table file.
pub struct TableBuilder {
    file: File,
    block: block::Builder,
    index: Index,
    offset: u64,
    block_size: usize,
    last_key: Vec<u8>,
    entry_count: u64,
    finished: bool,
}

impl TableBuilder {
    pub fn new(file: File, options: &Options) -> Self {
        Self {
            file,
            block: block::Builder::new(options.block_restart_interval),
            index: Index::new(),
            offset: 0,
            block_size: options.block_size,
            last_key: Vec::new(),
            entry_count: 0,
            finished: false,
        }
    }

    /// Appends one entry. Keys must arrive globally sorted.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::ReadOnly);
        }
        self.block.add(key, value)?;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;

        if self.block.current_size_estimate() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let data = self.block.finish();
        self.file.write_all(data)?;
        self.index
            .push(std::mem::take(&mut self.last_key), self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        self.block.reset();
        Ok(())
    }

    /// Flushes the pending block, writes the index block and the footer,
    /// and syncs the file. Returns the total file size in bytes.
    pub fn finish(mut self) -> Result<u64> {
        self.finished = true;
        self.flush_block()?;

        let index_data: Vec<u8> = (&self.index).try_into()?;
        let index_offset = self.offset;

        self.file.write_all(&index_data)?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.write_u64::<BigEndian>(index_data.len() as u64)?;
        self.file.write_u64::<BigEndian>(MAGIC)?;
        self.file.flush()?;
        self.file.sync_all()?;

        Ok(index_offset + index_data.len() as u64 + FOOTER_SIZE)
    }
}

/// An open, immutable sorted table.
pub struct Table {
    file: File,
    path: PathBuf,
    index: Index,
}

impl Table {
    /// Opens a table file and loads its index into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return Err(Error::Decode(
                "table footer",
                io::Error::new(io::ErrorKind::UnexpectedEof, "file too short"),
            ));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        let index_length = file.read_u64::<BigEndian>()?;
        let magic = file.read_u64::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic in {}",
                path.display()
            )));
        }
        if index_offset + index_length + FOOTER_SIZE != file_size {
            return Err(Error::Corruption(format!(
                "inconsistent index handle in {}",
                path.display()
            )));
        }

        let mut index_data = vec![0u8; index_length as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = Index::try_from(index_data.as_slice())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_block(&self, handle: BlockHandle) -> Result<Block> {
        let mut block_data = vec![0u8; handle.length as usize];
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(handle.offset))?;
        reader.read_exact(&mut block_data)?;
        Block::new(block_data)
    }

    /// Point lookup through the sparse index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(handle) = self.index.find(key) else {
            return Ok(None);
        };
        let block = Arc::new(self.read_block(handle)?);
        let mut iter = block.iter();
        iter.seek(key)?;
        match iter.next() {
            Some(Ok((found, value))) if compare_keys(&found, key) == Ordering::Equal => {
                Ok(Some(value))
            }
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Full forward scan in comparator order.
    pub fn iter(&self) -> Result<TableIterator> {
        Ok(TableIterator {
            reader: self.file.try_clone()?,
            handles: self.index.handles(),
            current: None,
            next_block: 0,
        })
    }
}

/// Iterates every entry of a table, loading data blocks one at a time.
pub struct TableIterator {
    reader: File,
    handles: Vec<BlockHandle>,
    current: Option<BlockIterator>,
    next_block: usize,
}

impl TableIterator {
    fn load_next_block(&mut self) -> Result<bool> {
        let Some(handle) = self.handles.get(self.next_block).copied() else {
            self.current = None;
            return Ok(false);
        };
        let mut block_data = vec![0u8; handle.length as usize];
        self.reader.seek(SeekFrom::Start(handle.offset))?;
        self.reader.read_exact(&mut block_data)?;
        self.current = Some(Arc::new(Block::new(block_data)?).iter());
        self.next_block += 1;
        Ok(true)
    }
}

impl Iterator for TableIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
            }
            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::InternalKey;
    use tempfile::TempDir;

    fn sample_entries(n: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        // Comparator order: ascending entity, descending time per entity.
        let mut entries = Vec::new();
        for entity in 0..n {
            for time in [30, 20, 10] {
                let key = InternalKey::new(1, entity, time);
                entries.push((key.encode(), format!("v-{entity}-{time}").into_bytes()));
            }
        }
        entries
    }

    fn write_table(path: &Path, entries: &[(Vec<u8>, Vec<u8>)], options: &Options) -> u64 {
        let file = File::create(path).unwrap();
        let mut builder = TableBuilder::new(file, options);
        for (key, value) in entries {
            builder.add(key, value).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_write_and_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.prop");
        let entries = sample_entries(10);
        let size = write_table(&path, &entries, &Options::default());

        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let table = Table::open(&path).unwrap();
        let scanned: Vec<(Vec<u8>, Vec<u8>)> =
            table.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_multi_block_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.prop");
        let entries = sample_entries(50);
        // Tiny blocks force many index entries.
        let options = Options::default().block_size(64);
        write_table(&path, &entries, &options);

        let table = Table::open(&path).unwrap();
        assert!(table.index.len() > 1);
        let scanned: Vec<(Vec<u8>, Vec<u8>)> =
            table.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_get() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.prop");
        let entries = sample_entries(20);
        let options = Options::default().block_size(128);
        write_table(&path, &entries, &options);

        let table = Table::open(&path).unwrap();
        let value = table
            .get(&InternalKey::new(1, 7, 20).encode())
            .unwrap()
            .unwrap();
        assert_eq!(value, b"v-7-20");

        assert!(table
            .get(&InternalKey::new(1, 7, 25).encode())
            .unwrap()
            .is_none());
        assert!(table
            .get(&InternalKey::new(3, 0, 0).encode())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.prop");
        std::fs::write(&path, b"too short").unwrap();
        assert!(Table::open(&path).is_err());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.prop");
        write_table(&path, &sample_entries(2), &Options::default());

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 1] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        assert!(matches!(Table::open(&path), Err(Error::Corruption(_))));
    }
}
