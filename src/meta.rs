//! Store metadata: the file hierarchy of every property and its persistence.
//!
//! `SystemMeta` is the single authority on which files exist. Readers take
//! the lock in shared mode for the duration of one lookup; the merge worker
//! takes it exclusively only around the batched `update_meta_info` calls and
//! the `force` that persists them. `force` writes the full image to a temp
//! file and renames it over the live one, so a crash leaves either the old
//! or the new metadata, never a mix.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::filename::{META_FILE, META_TEMP_FILE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A property's unstable level holds at most this many files, in slots
/// 0..MAX_UNSTABLE_SLOTS. Filling the last slot triggers promotion.
pub const MAX_UNSTABLE_SLOTS: u64 = 5;

/// Identifies one on-disk sorted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetaData {
    /// Slot id for unstable files, monotone id for stable files.
    pub number: u64,
    pub size: u64,
    /// Smallest time instant covered by the file.
    pub smallest: i32,
    /// Largest time instant covered by the file.
    pub largest: i32,
}

impl FileMetaData {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.number).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_i32::<BigEndian>(self.smallest).unwrap();
        buf.write_i32::<BigEndian>(self.largest).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            number: cursor.read_u64::<BigEndian>()?,
            size: cursor.read_u64::<BigEndian>()?,
            smallest: cursor.read_i32::<BigEndian>()?,
            largest: cursor.read_i32::<BigEndian>()?,
        })
    }
}

/// Per-property file hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMetaData {
    property_id: u32,
    /// Unstable files keyed by slot id. Always a contiguous prefix of
    /// 0..MAX_UNSTABLE_SLOTS in a consistent store.
    unstable: BTreeMap<u64, FileMetaData>,
    /// Stable files in ascending, disjoint time ranges.
    stable: Vec<FileMetaData>,
    /// Unstable slots that currently have an overlay buffer.
    unstable_buffers: BTreeSet<u64>,
    /// Stable file ids that currently have an overlay buffer.
    stable_buffers: BTreeSet<u64>,
}

impl PropertyMetaData {
    pub fn new(property_id: u32) -> Self {
        Self {
            property_id,
            unstable: BTreeMap::new(),
            stable: Vec::new(),
            unstable_buffers: BTreeSet::new(),
            stable_buffers: BTreeSet::new(),
        }
    }

    pub fn property_id(&self) -> u32 {
        self.property_id
    }

    pub fn unstable_files(&self) -> &BTreeMap<u64, FileMetaData> {
        &self.unstable
    }

    pub fn add_unstable(&mut self, meta: FileMetaData) {
        self.unstable.insert(meta.number, meta);
    }

    pub fn del_unstable(&mut self, slot: u64) {
        self.unstable.remove(&slot);
    }

    pub fn register_unstable_buffer(&mut self, slot: u64) {
        self.unstable_buffers.insert(slot);
    }

    pub fn del_unstable_buffer(&mut self, slot: u64) {
        self.unstable_buffers.remove(&slot);
    }

    pub fn has_unstable_buffer(&self, slot: u64) -> bool {
        self.unstable_buffers.contains(&slot)
    }

    pub fn register_stable_buffer(&mut self, id: u64) {
        self.stable_buffers.insert(id);
    }

    pub fn has_stable_buffer(&self, id: u64) -> bool {
        self.stable_buffers.contains(&id)
    }

    pub fn stable_files(&self) -> &[FileMetaData] {
        &self.stable
    }

    pub fn has_stable(&self) -> bool {
        !self.stable.is_empty()
    }

    pub fn latest_stable(&self) -> Option<&FileMetaData> {
        self.stable.last()
    }

    /// Largest time instant covered by the stable level.
    pub fn stable_max_time(&self) -> Option<i32> {
        self.latest_stable().map(|meta| meta.largest)
    }

    /// Monotone id for the next stable file, derived from current metadata
    /// so a retried promotion picks the same id.
    pub fn next_stable_id(&self) -> u64 {
        self.latest_stable().map(|meta| meta.number + 1).unwrap_or(1)
    }

    pub fn add_stable(&mut self, meta: FileMetaData) {
        debug_assert!(
            self.stable
                .last()
                .map(|prev| prev.largest < meta.smallest)
                .unwrap_or(true),
            "stable time ranges must be disjoint and increasing"
        );
        self.stable.push(meta);
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.property_id).unwrap();

        buf.write_u32::<BigEndian>(self.unstable.len() as u32).unwrap();
        for meta in self.unstable.values() {
            meta.encode_into(buf);
        }

        buf.write_u32::<BigEndian>(self.stable.len() as u32).unwrap();
        for meta in &self.stable {
            meta.encode_into(buf);
        }

        buf.write_u32::<BigEndian>(self.unstable_buffers.len() as u32)
            .unwrap();
        for slot in &self.unstable_buffers {
            buf.write_u64::<BigEndian>(*slot).unwrap();
        }

        buf.write_u32::<BigEndian>(self.stable_buffers.len() as u32)
            .unwrap();
        for id in &self.stable_buffers {
            buf.write_u64::<BigEndian>(*id).unwrap();
        }
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let property_id = cursor.read_u32::<BigEndian>()?;

        let mut unstable = BTreeMap::new();
        for _ in 0..cursor.read_u32::<BigEndian>()? {
            let meta = FileMetaData::decode_from(cursor)?;
            unstable.insert(meta.number, meta);
        }

        let mut stable = Vec::new();
        for _ in 0..cursor.read_u32::<BigEndian>()? {
            stable.push(FileMetaData::decode_from(cursor)?);
        }

        let mut unstable_buffers = BTreeSet::new();
        for _ in 0..cursor.read_u32::<BigEndian>()? {
            unstable_buffers.insert(cursor.read_u64::<BigEndian>()?);
        }

        let mut stable_buffers = BTreeSet::new();
        for _ in 0..cursor.read_u32::<BigEndian>()? {
            stable_buffers.insert(cursor.read_u64::<BigEndian>()?);
        }

        Ok(Self {
            property_id,
            unstable,
            stable,
            unstable_buffers,
            stable_buffers,
        })
    }
}

/// All property metadata of one store, behind a shared/exclusive lock.
#[derive(Debug, Default)]
pub struct SystemMeta {
    properties: RwLock<BTreeMap<u32, PropertyMetaData>>,
}

pub type MetaReadGuard<'a> = RwLockReadGuard<'a, BTreeMap<u32, PropertyMetaData>>;
pub type MetaWriteGuard<'a> = RwLockWriteGuard<'a, BTreeMap<u32, PropertyMetaData>>;

impl SystemMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores metadata from the store root, or starts empty when no
    /// metadata file exists yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(META_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < 4 {
            return Err(Error::Corruption("metadata file too short".into()));
        }

        let (payload, crc_bytes) = raw.split_at(raw.len() - 4);
        let stored = BigEndian::read_u32(crc_bytes);
        if CRC32.checksum(payload) != stored {
            return Err(Error::Corruption("metadata checksum mismatch".into()));
        }

        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u32::<BigEndian>()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let pmeta = PropertyMetaData::decode_from(&mut cursor)?;
            properties.insert(pmeta.property_id, pmeta);
        }

        Ok(Self {
            properties: RwLock::new(properties),
        })
    }

    /// Shared lock for readers.
    pub fn read(&self) -> Result<MetaReadGuard<'_>> {
        Ok(self.properties.read()?)
    }

    /// Exclusive lock for the merge worker's metadata flip.
    pub fn lock_exclusive(&self) -> Result<MetaWriteGuard<'_>> {
        Ok(self.properties.write()?)
    }

    /// Creates an empty PropertyMetaData for any listed property that does
    /// not have one yet.
    pub fn register_properties(&self, property_ids: impl IntoIterator<Item = u32>) -> Result<()> {
        let mut properties = self.properties.write()?;
        for property_id in property_ids {
            properties
                .entry(property_id)
                .or_insert_with(|| PropertyMetaData::new(property_id));
        }
        Ok(())
    }

    /// Atomically persists `properties` under the store root. Callers hold
    /// the exclusive lock so the image is internally consistent.
    pub fn persist(properties: &BTreeMap<u32, PropertyMetaData>, root: &Path) -> Result<()> {
        let mut payload = Vec::new();
        payload
            .write_u32::<BigEndian>(properties.len() as u32)
            .unwrap();
        for pmeta in properties.values() {
            pmeta.encode_into(&mut payload);
        }
        let checksum = CRC32.checksum(&payload);

        let temp_path = root.join(META_TEMP_FILE);
        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        temp.write_all(&payload)?;
        temp.write_u32::<BigEndian>(checksum)?;
        temp.sync_all()?;
        drop(temp);

        std::fs::rename(&temp_path, root.join(META_FILE))?;
        // Make the rename itself durable.
        File::open(root)?.sync_all()?;
        Ok(())
    }

    /// Persists the current metadata under a shared lock. The worker calls
    /// [`SystemMeta::persist`] directly while holding the exclusive guard.
    pub fn force(&self, root: &Path) -> Result<()> {
        let properties = self.properties.read()?;
        Self::persist(&properties, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_property() -> PropertyMetaData {
        let mut pmeta = PropertyMetaData::new(7);
        pmeta.add_unstable(FileMetaData {
            number: 0,
            size: 100,
            smallest: 10,
            largest: 20,
        });
        pmeta.add_unstable(FileMetaData {
            number: 1,
            size: 200,
            smallest: 21,
            largest: 40,
        });
        pmeta.add_stable(FileMetaData {
            number: 1,
            size: 4096,
            smallest: 0,
            largest: 9,
        });
        pmeta.register_unstable_buffer(0);
        pmeta.register_stable_buffer(1);
        pmeta
    }

    #[test]
    fn test_next_stable_id() {
        let mut pmeta = PropertyMetaData::new(1);
        assert_eq!(pmeta.next_stable_id(), 1);

        pmeta.add_stable(FileMetaData {
            number: 1,
            size: 1,
            smallest: 0,
            largest: 5,
        });
        assert_eq!(pmeta.next_stable_id(), 2);
        assert_eq!(pmeta.stable_max_time(), Some(5));
    }

    #[test]
    fn test_property_roundtrip() {
        let original = sample_property();
        let mut buf = Vec::new();
        original.encode_into(&mut buf);

        let mut cursor = Cursor::new(buf.as_slice());
        let decoded = PropertyMetaData::decode_from(&mut cursor).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let meta = SystemMeta::new();
        meta.register_properties([7]).unwrap();
        {
            let mut properties = meta.lock_exclusive().unwrap();
            *properties.get_mut(&7).unwrap() = sample_property();
            SystemMeta::persist(&properties, dir.path()).unwrap();
        }

        let restored = SystemMeta::load(dir.path()).unwrap();
        let properties = restored.read().unwrap();
        assert_eq!(properties.get(&7), Some(&sample_property()));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let meta = SystemMeta::load(dir.path()).unwrap();
        assert!(meta.read().unwrap().is_empty());
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let meta = SystemMeta::new();
        meta.register_properties([1]).unwrap();
        meta.force(dir.path()).unwrap();

        let path = dir.path().join(META_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            SystemMeta::load(dir.path()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_force_replaces_previous_image() {
        let dir = TempDir::new().unwrap();
        let meta = SystemMeta::new();
        meta.register_properties([1]).unwrap();
        meta.force(dir.path()).unwrap();
        meta.register_properties([2]).unwrap();
        meta.force(dir.path()).unwrap();

        let restored = SystemMeta::load(dir.path()).unwrap();
        let properties = restored.read().unwrap();
        assert_eq!(properties.len(), 2);
    }
}
