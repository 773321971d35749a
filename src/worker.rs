//! The background merge worker.
//!
//! One dedicated thread per store consumes an unbounded FIFO of memtables.
//! Each cycle partitions the buffer by property, builds every property's new
//! file with no lock held, then takes the exclusive metadata lock once to
//! flip and persist the whole batch, and finally reclaims the merged inputs.
//! Readers holding the shared lock either see the complete old file set or
//! the complete new one, never a mix; iterators they already hold survive
//! the reclamation through the cache's deferred close.
//!
//! Back-pressure is the write path's responsibility via memtable size
//! limits; the queue itself never blocks an `offer`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::TableCache;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::filename;
use crate::memtable::MemTable;
use crate::merge::MergeTask;
use crate::meta::SystemMeta;

enum Job {
    Merge(MemTable),
    Shutdown,
}

pub struct MergeWorker {
    tx: Sender<Job>,
    queued: Arc<AtomicUsize>,
    merging: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Spawns the worker thread for the store rooted at `options.dir`.
    pub fn start(
        meta: Arc<SystemMeta>,
        cache: Arc<TableCache>,
        options: Options,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let queued = Arc::new(AtomicUsize::new(0));
        let merging = Arc::new(AtomicBool::new(false));

        let store_name = options
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());

        let handle = std::thread::Builder::new()
            .name(format!("chronodb-merge-{store_name}"))
            .spawn({
                let queued = queued.clone();
                let merging = merging.clone();
                move || worker_loop(rx, meta, cache, options, queued, merging)
            })?;

        Ok(Self {
            tx,
            queued,
            merging,
            handle: Some(handle),
        })
    }

    /// Enqueues a full memtable for persistence.
    pub fn offer(&self, mem: MemTable) -> Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Job::Merge(mem)).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            Error::Shutdown
        })
    }

    /// True while a cycle is in flight or buffers are queued.
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst) || self.queued.load(Ordering::SeqCst) > 0
    }

    /// Blocks until every queued buffer has been processed.
    pub fn drain(&self) {
        while self.is_merging() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the worker after the cycle in flight, if any, completes.
    /// Queued but unprocessed buffers are dropped; they are re-derived from
    /// the write-ahead log on restart.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Job::Shutdown);
            if handle.join().is_err() {
                tracing::error!("merge worker thread panicked");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_loop(
    rx: Receiver<Job>,
    meta: Arc<SystemMeta>,
    cache: Arc<TableCache>,
    options: Options,
    queued: Arc<AtomicUsize>,
    merging: Arc<AtomicBool>,
) {
    loop {
        let job = match rx.recv() {
            Ok(job) => job,
            // All senders gone; nothing more can arrive.
            Err(_) => break,
        };
        match job {
            Job::Shutdown => break,
            Job::Merge(mem) => {
                merging.store(true, Ordering::SeqCst);
                queued.fetch_sub(1, Ordering::SeqCst);

                if !mem.is_empty() {
                    match run_cycle(&meta, &cache, &options, mem) {
                        Ok(()) => {}
                        Err(e @ Error::Corruption(_)) => {
                            // The metadata no longer matches the data; only a
                            // restart from the write-ahead log can recover.
                            merging.store(false, Ordering::SeqCst);
                            panic!("merge worker halted: {e}");
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "merge cycle failed, buffer abandoned until next offer"
                            );
                        }
                    }
                }
                merging.store(false, Ordering::SeqCst);
            }
        }
    }
    tracing::info!("merge worker exiting");
}

fn run_cycle(
    meta: &SystemMeta,
    cache: &Arc<TableCache>,
    options: &Options,
    mem: MemTable,
) -> Result<()> {
    // Split the heterogeneous buffer into per-property sub-buffers. The
    // source iterates in comparator order, so each partition stays sorted.
    let mut partitions: BTreeMap<u32, MemTable> = BTreeMap::new();
    for (key, value) in mem.iter() {
        partitions
            .entry(key.property_id)
            .or_insert_with(MemTable::new)
            .add(key, value);
    }

    meta.register_properties(partitions.keys().copied())?;

    let mut tasks = Vec::new();
    {
        let properties = meta.read()?;
        for (property_id, sub) in partitions {
            let pmeta = properties
                .get(&property_id)
                .ok_or_else(|| crate::corruption!("property {property_id} not registered"))?;
            std::fs::create_dir_all(filename::property_dir(&options.dir, property_id))?;

            if let Some(task) = MergeTask::new(sub, pmeta, cache.clone(), options.clone())? {
                tasks.push(task);
            }
        }
    }

    // All file IO happens before the lock.
    for task in &mut tasks {
        task.build_new_file()?;
    }

    {
        let mut properties = meta.lock_exclusive()?;
        for task in &mut tasks {
            task.update_meta_info(&mut properties)?;
        }
        if let Err(e) = SystemMeta::persist(&properties, &options.dir) {
            // In-memory metadata now references files the on-disk image does
            // not; continuing would diverge the two permanently.
            tracing::error!(error = %e, "failed to force metadata");
            panic!("cannot persist store metadata: {e}");
        }
    }

    for task in &tasks {
        task.delete_obsolete_files();
    }

    tracing::info!(properties = tasks.len(), "completed merge cycle");
    Ok(())
}
