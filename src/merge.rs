//! The per-property merge task.
//!
//! A task folds one property's share of an offered memtable together with
//! the property's unstable files into a single new file. Participant
//! selection walks unstable slots 0..4 and takes the contiguous prefix that
//! exists, a carry chain: merging k participants produces slot k, so slot k
//! always holds the fold of everything that previously occupied slots
//! 0..k-1. Once all five slots are full the fold is promoted to a new
//! stable file and the unstable level empties.
//!
//! The task runs in three phases with distinct locking requirements:
//! `build_new_file` does all file IO with no lock held, `update_meta_info`
//! performs only in-memory metadata edits under the exclusive meta lock, and
//! `delete_obsolete_files` reclaims the merged inputs after the metadata
//! flip has been persisted.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::FileBuffer;
use crate::cache::TableCache;
use crate::config::Options;
use crate::corruption;
use crate::error::{Error, Result};
use crate::filename;
use crate::iterator::{
    BufferFileAndTableIterator, EntryIterator, MergingIterator, TableLatestValueIterator,
};
use crate::key::InternalKey;
use crate::memtable::MemTable;
use crate::meta::{FileMetaData, PropertyMetaData, MAX_UNSTABLE_SLOTS};
use crate::sstable::TableBuilder;

/// Latest stable file snapshot used for the promotion carry-forward.
struct StableCarry {
    number: u64,
    has_buffer: bool,
}

pub struct MergeTask {
    property_id: u32,
    prop_dir: PathBuf,
    mem: MemTable,
    cache: Arc<TableCache>,
    options: Options,

    participants: Vec<u64>,
    participant_min_time: Option<i32>,
    participant_buffers: Vec<u64>,
    stable_carry: Option<StableCarry>,
    target_number: u64,

    entry_count: u64,
    min_time: i32,
    max_time: i32,
    file_size: u64,
    built: bool,

    tables_to_evict: Vec<PathBuf>,
    files_to_delete: Vec<PathBuf>,
}

impl MergeTask {
    /// Plans a merge for one property from a metadata snapshot. Returns
    /// `None` when the sub-buffer is empty.
    pub fn new(
        mem: MemTable,
        pmeta: &PropertyMetaData,
        cache: Arc<TableCache>,
        options: Options,
    ) -> Result<Option<Self>> {
        if mem.is_empty() {
            return Ok(None);
        }
        let prop_dir = filename::property_dir(&options.dir, pmeta.property_id());

        let unstable = pmeta.unstable_files();
        if let Some(slot) = unstable.keys().find(|&&slot| slot >= MAX_UNSTABLE_SLOTS) {
            return Err(corruption!(
                "property {} has unstable file in invalid slot {slot}",
                pmeta.property_id()
            ));
        }

        let mut participants = Vec::new();
        for slot in 0..MAX_UNSTABLE_SLOTS {
            if unstable.contains_key(&slot) {
                participants.push(slot);
            } else {
                break;
            }
        }

        let promote = participants.len() as u64 == MAX_UNSTABLE_SLOTS;
        let target_number = if promote {
            pmeta.next_stable_id()
        } else {
            participants.len() as u64
        };

        let participant_min_time = participants
            .iter()
            .filter_map(|slot| unstable.get(slot))
            .map(|meta| meta.smallest)
            .min();
        let participant_buffers = participants
            .iter()
            .copied()
            .filter(|&slot| pmeta.has_unstable_buffer(slot))
            .collect();

        let stable_carry = if promote && pmeta.has_stable() {
            pmeta.latest_stable().map(|meta| StableCarry {
                number: meta.number,
                has_buffer: pmeta.has_stable_buffer(meta.number),
            })
        } else {
            None
        };

        Ok(Some(Self {
            property_id: pmeta.property_id(),
            prop_dir,
            mem,
            cache,
            options,
            participants,
            participant_min_time,
            participant_buffers,
            stable_carry,
            target_number,
            entry_count: 0,
            min_time: i32::MAX,
            max_time: i32::MIN,
            file_size: 0,
            built: false,
            tables_to_evict: Vec::new(),
            files_to_delete: Vec::new(),
        }))
    }

    /// Whether this task promotes into a new stable file.
    pub fn is_promotion(&self) -> bool {
        self.participants.len() as u64 == MAX_UNSTABLE_SLOTS
    }

    pub fn property_id(&self) -> u32 {
        self.property_id
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn target_file_name(&self) -> String {
        if self.is_promotion() {
            filename::stable_file(self.target_number)
        } else {
            filename::unstable_file(self.target_number)
        }
    }

    /// Creates the output file, replacing any stale leftover from an
    /// abandoned attempt. The target name is deterministic given current
    /// metadata, so a retry overwrites its own debris.
    fn merge_init(&self) -> Result<TableBuilder> {
        let target = self.prop_dir.join(self.target_file_name());
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        let file = File::create(&target)?;
        Ok(TableBuilder::new(file, &self.options))
    }

    /// Composes the merge input list, newest source first: the memtable,
    /// then (promotion only) the latest stable carry-forward, then the
    /// participant files in ascending slot order.
    fn data_iterator(&mut self) -> Result<MergingIterator> {
        let mut sources: Vec<EntryIterator> = Vec::new();

        let mem_entries: Vec<Result<(Vec<u8>, Vec<u8>)>> = self
            .mem
            .iter()
            .map(|(key, value)| Ok((key.encode(), value)))
            .collect();
        sources.push(Box::new(mem_entries.into_iter()));

        if let Some(carry) = &self.stable_carry {
            sources.push(self.stable_latest_value_iter(carry)?);
        }

        for slot in self.participants.clone() {
            let table_path = self.prop_dir.join(filename::unstable_file(slot));
            let table = self.cache.get(&table_path)?;
            let table_iter: EntryIterator = Box::new(table.iter()?);

            let source: EntryIterator = if self.participant_buffers.contains(&slot) {
                let buffer_path = self.prop_dir.join(filename::unstable_buffer(slot));
                let buffer = FileBuffer::open(&buffer_path)?;
                self.files_to_delete.push(buffer_path);
                Box::new(BufferFileAndTableIterator::new(
                    Box::new(buffer.into_iter()),
                    table_iter,
                ))
            } else {
                table_iter
            };
            sources.push(source);

            self.tables_to_evict.push(table_path.clone());
            self.files_to_delete.push(table_path);
        }

        Ok(MergingIterator::new(sources))
    }

    /// During promotion, carries forward the single most recent value per
    /// entity from the latest stable file so readers keep seeing continuous
    /// timelines. The stable file itself is left in place.
    fn stable_latest_value_iter(&self, carry: &StableCarry) -> Result<EntryIterator> {
        let path = self.prop_dir.join(filename::stable_file(carry.number));
        let table = self.cache.get(&path)?;
        let mut iter: EntryIterator = Box::new(table.iter()?);
        if carry.has_buffer {
            let buffer_path = self.prop_dir.join(filename::stable_buffer(carry.number));
            let buffer = FileBuffer::open(&buffer_path)?;
            iter = Box::new(BufferFileAndTableIterator::new(
                Box::new(buffer.into_iter()),
                iter,
            ));
        }
        Ok(Box::new(TableLatestValueIterator::new(iter)))
    }

    /// Streams the composed merge into the output file. Runs outside any
    /// lock; the output is durable but not yet referenced by metadata.
    pub fn build_new_file(&mut self) -> Result<()> {
        let mut builder = self.merge_init()?;

        for entry in self.data_iterator()? {
            let (key, value) = entry?;
            let decoded = InternalKey::decode(&key)?;
            self.min_time = self.min_time.min(decoded.start_time);
            self.max_time = self.max_time.max(decoded.start_time);
            builder.add(&key, &value)?;
            self.entry_count += 1;
        }

        self.file_size = builder.finish()?;
        self.built = true;

        tracing::debug!(
            property_id = self.property_id,
            file = %self.target_file_name(),
            entries = self.entry_count,
            bytes = self.file_size,
            "built merge output"
        );
        Ok(())
    }

    /// Flips this property's metadata to reference the new file. Must be
    /// called under the system-wide exclusive metadata lock, after
    /// `build_new_file`.
    pub fn update_meta_info(
        &mut self,
        properties: &mut BTreeMap<u32, PropertyMetaData>,
    ) -> Result<()> {
        if !self.built {
            return Err(Error::InvalidOperation(
                "update_meta_info called before build_new_file".into(),
            ));
        }
        let pmeta = properties
            .get_mut(&self.property_id)
            .ok_or_else(|| corruption!("no metadata for property {}", self.property_id))?;

        for &slot in &self.participants {
            pmeta.del_unstable(slot);
            pmeta.del_unstable_buffer(slot);
        }

        if self.is_promotion() {
            let smallest = pmeta.stable_max_time().map(|t| t + 1).unwrap_or(0);
            pmeta.add_stable(FileMetaData {
                number: self.target_number,
                size: self.file_size,
                smallest,
                largest: self.max_time,
            });
        } else {
            // Memtable-only keys may predate every participant, so the new
            // slot's range opens at whichever is older.
            let smallest = self
                .participant_min_time
                .map(|t| t.min(self.min_time))
                .unwrap_or(self.min_time);
            assert!(
                smallest <= self.min_time,
                "unstable slot startTime exceeds smallest merged key"
            );
            pmeta.add_unstable(FileMetaData {
                number: self.target_number,
                size: self.file_size,
                smallest,
                largest: self.max_time,
            });
        }
        Ok(())
    }

    /// Evicts merged inputs from the table cache and deletes their files.
    /// Runs outside the lock, only after the metadata flip is durable.
    /// Failures leave orphans for a later sweep and are not fatal.
    pub fn delete_obsolete_files(&self) {
        for path in &self.tables_to_evict {
            self.cache.evict(path);
        }
        for path in &self.files_to_delete {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(
                    file = %path.display(),
                    error = %e,
                    "failed to delete obsolete file"
                );
            }
        }
    }
}
