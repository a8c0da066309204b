//! Shared helpers for the scenario tests: a unique on-disk image path per
//! test, and cleanup of both the image and its parent directory.

use std::fs::{create_dir_all, remove_dir_all};
use std::path::PathBuf;

/// Number of sectors used by every scenario test's device image.
pub const NSECTORS: u64 = 512;

/// A fresh, non-existent path for a device image unique to `name`.
pub fn disk_prep_path(name: &str) -> PathBuf {
    let mut dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    dir.push("target-test-images-scenarios-".to_string() + name);
    if dir.exists() {
        remove_dir_all(&dir).unwrap();
    }
    create_dir_all(&dir).unwrap();
    dir.join("img")
}

/// Remove everything under a path prepared by [`disk_prep_path`].
pub fn disk_cleanup(path: &std::path::Path) {
    let _ = remove_dir_all(path.parent().unwrap());
}
