//! Deterministic file naming inside a property store directory.

use std::path::{Path, PathBuf};

/// Metadata file holding the PropertyMetaData of every property in the store.
pub const META_FILE: &str = "meta.chronodb";

/// Scratch name used while persisting metadata; renamed over [`META_FILE`]
/// once fully written and synced.
pub const META_TEMP_FILE: &str = "meta.tmp";

/// Sorted table for unstable slot `slot`.
pub fn unstable_file(slot: u64) -> String {
    format!("unstable-{slot}.prop")
}

/// Overlay buffer for unstable slot `slot`.
pub fn unstable_buffer(slot: u64) -> String {
    format!("unstable-{slot}.buf")
}

/// Sorted table for stable file `id`.
pub fn stable_file(id: u64) -> String {
    format!("stable-{id}.prop")
}

/// Overlay buffer for stable file `id`.
pub fn stable_buffer(id: u64) -> String {
    format!("stable-{id}.buf")
}

/// Directory holding all files of one property.
pub fn property_dir(root: &Path, property_id: u32) -> PathBuf {
    root.join(format!("prop-{property_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(unstable_file(3), "unstable-3.prop");
        assert_eq!(unstable_buffer(3), "unstable-3.buf");
        assert_eq!(stable_file(12), "stable-12.prop");
        assert_eq!(stable_buffer(12), "stable-12.buf");
    }

    #[test]
    fn test_property_dir() {
        let dir = property_dir(Path::new("/store"), 7);
        assert_eq!(dir, PathBuf::from("/store/prop-7"));
    }
}
