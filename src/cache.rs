//! Bounded cache of open sorted tables.
//!
//! Maps a table file path to an open [`Table`] handle. On a miss the file is
//! opened and inserted; the least recently used entry is dropped once the
//! cache is over capacity. Handles are shared as `Arc<Table>`: evicting an
//! entry only drops the cache's reference, so a reader holding an iterator
//! obtained before the eviction keeps a valid table until the iterator (and
//! its `Arc`) is dropped. The physical close happens at refcount zero.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::sstable::Table;

pub struct TableCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    entries: HashMap<PathBuf, Arc<Table>>,
    /// Recency order, least recently used at the front.
    order: VecDeque<PathBuf>,
}

impl TableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Returns the open table for `path`, loading it on a miss. Concurrent
    /// misses on the same path serialize on the cache lock, so the file is
    /// opened once.
    pub fn get(&self, path: &Path) -> Result<Arc<Table>> {
        let mut inner = self.inner.lock()?;

        if let Some(table) = inner.entries.get(path).cloned() {
            inner.touch(path);
            return Ok(table);
        }

        let table = Arc::new(Table::open(path)?);
        inner.entries.insert(path.to_path_buf(), table.clone());
        inner.order.push_back(path.to_path_buf());

        while inner.entries.len() > self.capacity {
            if let Some(victim) = inner.order.pop_front() {
                inner.entries.remove(&victim);
            }
        }
        Ok(table)
    }

    /// Drops the cache's reference to `path`. Outstanding iterators stay
    /// valid; the file closes when the last reference is dropped.
    pub fn evict(&self, path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.remove(path);
            inner.order.retain(|p| p != path);
        }
    }

    /// Invalidates every entry.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            let entry = self.order.remove(pos).unwrap();
            self.order.push_back(entry);
        }
    }
}
