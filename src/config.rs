use std::path::PathBuf;

/// Configuration for a property store and its merge worker.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the store's property directories and metadata
    pub dir: PathBuf,

    /// Record a restart point every this many block entries (default: 16)
    pub block_restart_interval: usize,

    /// Target size for a data block before it is flushed (default: 4KiB)
    pub block_size: usize,

    /// Maximum number of open tables held by the table cache (default: 64)
    pub table_cache_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./chronodb"),
            block_restart_interval: 16,
            block_size: 4 * 1024,
            table_cache_size: 64,
        }
    }
}

impl Options {
    /// Create options rooted at the given store directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the block restart interval
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the table cache capacity
    pub fn table_cache_size(mut self, size: usize) -> Self {
        self.table_cache_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let options = Options::default();
        assert_eq!(options.dir, PathBuf::from("./chronodb"));
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.block_size, 4 * 1024);
        assert_eq!(options.table_cache_size, 64);
    }

    #[test]
    fn test_config_builder() {
        let options = Options::new("/tmp/store")
            .block_restart_interval(4)
            .block_size(512)
            .table_cache_size(8);

        assert_eq!(options.dir, PathBuf::from("/tmp/store"));
        assert_eq!(options.block_restart_interval, 4);
        assert_eq!(options.block_size, 512);
        assert_eq!(options.table_cache_size, 8);
    }
}
