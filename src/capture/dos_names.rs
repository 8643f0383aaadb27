//! Per-directory map of DOS 8.3 short names, keyed by NTFS inode number.
//!
//! Populated while reading one directory; after the children have been
//! scanned, each Win32-named child is paired with its short name and the map
//! is dropped.

use std::collections::BTreeMap;

use log::warn;

/// A DOS name is at most 12 UTF-16 code units (24 bytes).
pub const DOS_NAME_MAX_BYTES: usize = 24;

#[derive(Debug, Default)]
pub struct DosNameMap {
    map: BTreeMap<u64, Vec<u16>>,
}

impl DosNameMap {
    pub fn new() -> Self {
        DosNameMap::default()
    }

    /// Record the DOS name of an inode. NTFS allows one DOS name per inode;
    /// a duplicate is discarded with a warning.
    pub fn insert(&mut self, ntfs_ino: u64, name: &[u16]) {
        if name.len() * 2 > DOS_NAME_MAX_BYTES {
            warn!("discarding overlong DOS name on NTFS inode {ntfs_ino}");
            return;
        }
        if self.map.contains_key(&ntfs_ino) {
            warn!("NTFS inode {ntfs_ino} has multiple DOS names");
            return;
        }
        self.map.insert(ntfs_ino, name.to_vec());
    }

    pub fn lookup(&self, ntfs_ino: u64) -> Option<&[u16]> {
        self.map.get(&ntfs_ino).map(Vec::as_slice)
    }
}
