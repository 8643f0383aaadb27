//! Capture of an NTFS volume into an in-memory WIM image.
//!
//! The scanner walks the directory tree recursively over inodes, building a
//! dentry tree that preserves named data streams, reparse points, security
//! descriptors, DOS short names, hard links, and timestamps. File payloads
//! are never read here; each non-empty stream gets a [`BlobDescriptor`]
//! pointing back into the volume.

pub mod dos_names;

use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};

use crate::blob::{BlobDescriptor, BlobLocation, NtfsLocation, REPARSE_DATA_OFFSET};
use crate::error::{Result, WimError};
use crate::image::security::SdSet;
use crate::image::{
    utf16_display, DentryId, Image, Inode, InodeId, Stream, StreamType, REPARSE_FLAG_NOT_FIXED,
    ZERO_HASH,
};
use crate::ntfs::{
    AttrType, MftRef, NameType, NtfsMounter, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_ENCRYPTED,
    FILE_ATTRIBUTE_REPARSE_POINT, FIRST_USER_MFT_NO,
};
use crate::volume::Volume;

use self::dos_names::DosNameMap;

/// Capture policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureOptions {
    /// Do not read or store security descriptors.
    pub no_acls: bool,
    /// Clear the not-fixed flag on symlink reparse data. A full-volume
    /// capture's link targets are already consistent with the image root.
    pub rpfix: bool,
    /// Fail on unsupported (encrypted) files instead of skipping them.
    pub strict_unsupported: bool,
}

/// Outcome reported for each scanned path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Ok,
    Excluded,
    Unsupported,
}

/// What to do with a per-dentry error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Propagate the error, tearing down the capture.
    Abort,
    /// Drop the affected subtree and keep scanning.
    Continue,
}

/// Caller hooks driving exclusion, progress, and error policy.
#[derive(Default)]
pub struct CaptureHooks<'a> {
    /// Path matcher; returning `true` excludes the path from the image.
    pub exclude: Option<Box<dyn FnMut(&str) -> Result<bool> + 'a>>,
    /// Per-dentry progress. An `Err` cancels the capture immediately.
    pub progress: Option<Box<dyn FnMut(&str, ScanStatus) -> Result<()> + 'a>>,
    /// Error policy for per-dentry failures. Without a hook, errors abort.
    pub on_error: Option<Box<dyn FnMut(&str, &WimError) -> ErrorAction + 'a>>,
}

/// Mount `device` read-only through `mounter` and capture it into an image.
pub fn capture_device(
    device: &Path,
    mounter: &dyn NtfsMounter,
    options: &CaptureOptions,
    hooks: &mut CaptureHooks<'_>,
) -> Result<Image> {
    let volume = Volume::mount_readonly(device, mounter)?;
    capture_volume(&volume, options, hooks)
}

/// Capture a mounted volume into an image, starting from the root directory.
pub fn capture_volume(
    volume: &Volume,
    options: &CaptureOptions,
    hooks: &mut CaptureHooks<'_>,
) -> Result<Image> {
    let mut scanner = Scanner {
        volume,
        options,
        hooks,
        image: Image::new(),
        inode_table: HashMap::new(),
        sd_set: SdSet::new(),
    };

    let root = scanner.scan_dentry(MftRef::root(), "/", Vec::new(), NameType::Posix)?;
    let Scanner { mut image, sd_set, .. } = scanner;
    image.root = root;
    image.security = sd_set.into_security_data();
    image.compact_inodes();
    Ok(image)
}

struct Scanner<'a, 'h> {
    volume: &'a Volume,
    options: &'a CaptureOptions,
    hooks: &'a mut CaptureHooks<'h>,
    image: Image,
    /// Volume inode number to shared inode; realizes hard links.
    inode_table: HashMap<u64, InodeId>,
    sd_set: SdSet,
}

/// Wrap an NTFS library failure with the path being scanned.
fn ntfs_error(path: &str, err: WimError) -> WimError {
    WimError::Ntfs {
        path: path.to_string(),
        msg: err.to_string(),
    }
}

impl Scanner<'_, '_> {
    /// Scan one inode into a dentry, routing failures through the error hook.
    /// Returns `None` when the path was excluded, unsupported, or its error
    /// was downgraded.
    fn scan_dentry(
        &mut self,
        mref: MftRef,
        path: &str,
        name: Vec<u16>,
        name_type: NameType,
    ) -> Result<Option<DentryId>> {
        let mut partial = None;
        match self.scan_dentry_inner(mref, path, name, name_type, &mut partial) {
            Ok(id) => Ok(id),
            Err(err) => {
                if let Some(id) = partial {
                    self.release_subtree(id);
                }
                match self.error_action(path, &err) {
                    ErrorAction::Continue => {
                        warn!("ignoring error on \"{path}\": {err}");
                        Ok(None)
                    }
                    ErrorAction::Abort => Err(err),
                }
            }
        }
    }

    fn scan_dentry_inner(
        &mut self,
        mref: MftRef,
        path: &str,
        name: Vec<u16>,
        name_type: NameType,
        partial: &mut Option<DentryId>,
    ) -> Result<Option<DentryId>> {
        if self.check_exclude(path)? {
            self.progress(path, ScanStatus::Excluded)?;
            return Ok(None);
        }

        let mft_no = mref.number();
        let attributes = self
            .volume
            .with_ops(|ops| ops.file_attributes(mft_no))
            .map_err(|e| ntfs_error(path, e))?;

        if attributes & FILE_ATTRIBUTE_ENCRYPTED != 0 {
            if self.options.strict_unsupported {
                return Err(WimError::UnsupportedFile(path.to_string()));
            }
            self.progress(path, ScanStatus::Unsupported)?;
            return Ok(None);
        }

        let (dentry, inode_shared) = self.table_new_dentry(name, mft_no);
        *partial = Some(dentry);
        if name_type.is_win32() {
            self.image.dentry_mut(dentry).is_win32_name = true;
        }

        // A shared inode has already been scanned through another link.
        if !inode_shared {
            self.scan_inode(dentry, mft_no, attributes, path)?;
        }

        self.progress(path, ScanStatus::Ok)?;
        Ok(Some(dentry))
    }

    /// Allocate a dentry bound to the inode for `mft_no`, creating the inode
    /// on first sight. The flag reports whether the inode was already known.
    fn table_new_dentry(&mut self, name: Vec<u16>, mft_no: u64) -> (DentryId, bool) {
        match self.inode_table.get(&mft_no) {
            Some(&inode) => (self.image.new_dentry(name, inode), true),
            None => {
                let inode = self.image.new_inode(Inode::new(mft_no));
                self.inode_table.insert(mft_no, inode);
                (self.image.new_dentry(name, inode), false)
            }
        }
    }

    /// Fill a freshly created inode: timestamps, attributes, streams,
    /// security descriptor; recurse if it is a directory.
    fn scan_inode(
        &mut self,
        dentry: DentryId,
        mft_no: u64,
        attributes: u32,
        path: &str,
    ) -> Result<()> {
        let times = self
            .volume
            .with_ops(|ops| ops.timestamps(mft_no))
            .map_err(|e| ntfs_error(path, e))?;
        let iid = self.image.dentry(dentry).inode;
        {
            let inode = self.image.inode_mut(iid);
            inode.creation_time = times.creation_time;
            inode.last_write_time = times.last_write_time;
            inode.last_access_time = times.last_access_time;
            inode.attributes = attributes;
        }

        if attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
            self.scan_attrs(iid, mft_no, path, AttrType::ReparsePoint)?;
        }

        // Directories should not have an unnamed data stream, but they may
        // have named data streams. Nondirectories (including reparse points)
        // can have both.
        self.scan_attrs(iid, mft_no, path, AttrType::Data)?;

        // In full-volume capture, reparse targets are already consistent.
        if self.options.rpfix && self.image.inode(iid).is_symlink() {
            self.image.inode_mut(iid).not_rpfixed &= !REPARSE_FLAG_NOT_FIXED;
        }

        if !self.options.no_acls {
            let sd = self
                .volume
                .with_ops(|ops| ops.security_descriptor(mft_no))
                .map_err(|e| ntfs_error(path, e))?;
            if let Some(sd) = sd {
                self.image.inode_mut(iid).security_id = self.sd_set.add(&sd);
            }
        }

        if attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
            self.recurse_directory(dentry, mft_no, path)?;
        }
        Ok(())
    }

    /// Build one stream per attribute of `attr_type`, attaching a blob
    /// descriptor for each non-empty payload.
    fn scan_attrs(
        &mut self,
        iid: InodeId,
        mft_no: u64,
        path: &str,
        attr_type: AttrType,
    ) -> Result<()> {
        let attrs = self
            .volume
            .with_ops(|ops| ops.attributes_of_type(mft_no, attr_type))
            .map_err(|e| ntfs_error(path, e))?;

        for info in attrs {
            let mut blob = None;
            if info.value_length > 0 {
                let mut size = info.value_length;
                if attr_type == AttrType::ReparsePoint {
                    if size < REPARSE_DATA_OFFSET {
                        return Err(WimError::InvalidReparseData {
                            path: path.to_string(),
                            size,
                        });
                    }
                    size -= REPARSE_DATA_OFFSET;
                    let tag = self.read_reparse_tag(mft_no, &info.name)?;
                    let inode = self.image.inode_mut(iid);
                    inode.reparse_tag = tag;
                    inode.not_rpfixed = REPARSE_FLAG_NOT_FIXED;
                }

                let lcn = self
                    .volume
                    .with_ops(|ops| ops.first_extent_lcn(mft_no, attr_type, &info.name))
                    .map_err(|e| ntfs_error(path, e))?;

                let descriptor = BlobDescriptor::in_ntfs_volume(
                    NtfsLocation {
                        volume: self.volume.clone(),
                        mft_no,
                        attr_type,
                        attr_name: info.name.clone(),
                        sort_key: lcn.unwrap_or(0),
                    },
                    size,
                );
                self.image.unhashed_blobs.push(descriptor.clone());
                blob = Some(descriptor);
            }

            let stream_type = match attr_type {
                AttrType::Data => StreamType::Data,
                AttrType::ReparsePoint => StreamType::ReparsePoint,
            };
            self.image.inode_mut(iid).streams.push(Stream {
                stream_type,
                name: info.name,
                hash: ZERO_HASH,
                blob,
            });
        }
        Ok(())
    }

    /// The reparse tag is the first 4 bytes of the reparse point attribute.
    fn read_reparse_tag(&mut self, mft_no: u64, attr_name: &[u16]) -> Result<u32> {
        let mut buf = [0u8; 4];
        let got = self.volume.with_ops(|ops| {
            ops.read_attribute(mft_no, AttrType::ReparsePoint, attr_name, 0, &mut buf)
        })?;
        if got != buf.len() {
            return Err(WimError::VolumeRead {
                mft_no,
                msg: "error reading reparse data".into(),
            });
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn recurse_directory(&mut self, parent: DentryId, mft_no: u64, path: &str) -> Result<()> {
        let entries = self
            .volume
            .with_ops(|ops| ops.read_dir(mft_no))
            .map_err(|e| ntfs_error(path, e))?;
        let mut dos_names = DosNameMap::new();

        for entry in entries {
            if entry.name == [b'.' as u16] || entry.name == [b'.' as u16, b'.' as u16] {
                continue;
            }
            // NTFS metafiles ($MFT, $Bitmap, ...) are never captured; real
            // files that merely look hidden or system are.
            if entry.mref.number() < FIRST_USER_MFT_NO {
                continue;
            }

            if entry.name_type.is_dos() {
                // Store the DOS name for pairing after the readdir pass;
                // a DOS-only entry names a child already reachable through
                // its Win32 entry, so it is not recursed into.
                dos_names.insert(entry.mref.number(), &entry.name);
                if entry.name_type == NameType::Dos {
                    continue;
                }
            }

            let display = utf16_display(&entry.name);
            let child_path = if path == "/" {
                format!("/{display}")
            } else {
                format!("{path}/{display}")
            };

            let child =
                self.scan_dentry(entry.mref, &child_path, entry.name.clone(), entry.name_type)?;
            if let Some(child) = child {
                self.image.add_child(parent, child);
            }
        }

        // Pair each Win32-named child with its DOS short name.
        let children = self.image.dentry(parent).children.clone();
        for child in children {
            if !self.image.dentry(child).is_win32_name {
                continue;
            }
            let ino = self.image.inode_of(child).ino;
            match dos_names.lookup(ino) {
                Some(short) => self.image.dentry_mut(child).short_name = short.to_vec(),
                None => warn!("NTFS inode {ino} has a Win32 name with no corresponding DOS name"),
            }
        }
        Ok(())
    }

    /// Undo a partially built subtree after a downgraded error: unlink its
    /// inodes and forget any payloads it registered.
    fn release_subtree(&mut self, start: DentryId) {
        for id in self.image.subtree_ids(start) {
            let iid = self.image.dentry(id).inode;
            let inode = self.image.inode_mut(iid);
            inode.nlink = inode.nlink.saturating_sub(1);
            if inode.nlink == 0 {
                let ino = inode.ino;
                self.inode_table.remove(&ino);
                self.image.unhashed_blobs.retain(|b| {
                    let BlobLocation::NtfsVolume(loc) = &b.location;
                    loc.mft_no != ino
                });
            }
        }
    }

    fn check_exclude(&mut self, path: &str) -> Result<bool> {
        match &mut self.hooks.exclude {
            Some(exclude) => exclude(path),
            None => Ok(false),
        }
    }

    fn progress(&mut self, path: &str, status: ScanStatus) -> Result<()> {
        debug!("scan {status:?}: {path}");
        match &mut self.hooks.progress {
            Some(progress) => progress(path, status),
            None => Ok(()),
        }
    }

    fn error_action(&mut self, path: &str, err: &WimError) -> ErrorAction {
        match &mut self.hooks.on_error {
            Some(on_error) => on_error(path, err),
            None => ErrorAction::Abort,
        }
    }
}
