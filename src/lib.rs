pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod filename;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod merge;
pub mod meta;
pub mod sstable;
pub mod worker;

pub use cache::TableCache;
pub use config::Options;
pub use error::{Error, Result};
pub use key::{InternalKey, ValueKind};
pub use memtable::MemTable;
pub use meta::SystemMeta;
pub use worker::MergeWorker;
