//! Overlay buffers: append-only deltas of late-arriving edits for a file.
//!
//! A `.buf` file sits next to its sorted table and holds edits that arrived
//! after the table was written. The write path appends records; the merge
//! worker layers the buffer over the table with a
//! `BufferFileAndTableIterator` and deletes the buffer once its contents are
//! folded into the merge output.
//!
//! On-disk format is a sequence of frames:
//!
//! ```text
//! +--------------+-----------+----------------+-------------+
//! | key_len: u32 | key bytes | value_len: u32 | value bytes |
//! +--------------+-----------+----------------+-------------+
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::InternalKey;

pub struct FileBuffer {
    path: PathBuf,
    file: File,
    data: BTreeMap<InternalKey, Vec<u8>>,
}

impl FileBuffer {
    /// Opens the buffer at `path`, creating it if absent and loading any
    /// existing frames.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let data = Self::parse(&raw)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            data,
        })
    }

    fn parse(raw: &[u8]) -> Result<BTreeMap<InternalKey, Vec<u8>>> {
        let mut data = BTreeMap::new();
        let mut cursor = Cursor::new(raw);
        while (cursor.position() as usize) < raw.len() {
            let key_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("buffer frame key length", e))? as usize;
            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Decode("buffer frame key", e))?;

            let value_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("buffer frame value length", e))? as usize;
            let mut value = vec![0u8; value_len];
            cursor
                .read_exact(&mut value)
                .map_err(|e| Error::Decode("buffer frame value", e))?;

            data.insert(InternalKey::decode(&key)?, value);
        }
        Ok(data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends one edit and records it in the in-memory image.
    pub fn append(&mut self, key: InternalKey, value: &[u8]) -> Result<()> {
        let encoded = key.encode();
        self.file.write_u32::<BigEndian>(encoded.len() as u32)?;
        self.file.write_all(&encoded)?;
        self.file.write_u32::<BigEndian>(value.len() as u32)?;
        self.file.write_all(value)?;
        self.data.insert(key, value.to_vec());
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Consumes the buffer, yielding its entries in comparator order.
    pub fn into_iter(self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send {
        self.data
            .into_iter()
            .map(|(key, value)| Ok((key.encode(), value)))
    }
}
