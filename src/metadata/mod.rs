//! The metadata resource: a length-prefixed security-descriptor table
//! followed by the image's dentry tree serialized in pre-order, with each
//! dentry's `subdir_offset` pointing at its first child.
//!
//! The reader consumes an already-decompressed buffer; the writer produces
//! one for the compressed-resource writer to consume. Both directions are
//! all-or-nothing: no partial image is ever returned.

pub mod dentry_io;

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::error::{Result, WimError};
use crate::image::fixup::fix_inodes;
use crate::image::security::{sha1_buffer, SecurityData};
use crate::image::{
    filetime_now, utf16_display, DentryId, Image, Inode, Sha1Hash, Stream, StreamType, ZERO_HASH,
};
use crate::ntfs::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_REPARSE_POINT};

use self::dentry_io::{
    dentry_out_total_length, read_dentry, write_dentry, DiskDentry, DENTRY_DISK_SIZE,
};

/// No metadata resource can be smaller than an empty security block plus a
/// root dentry header.
pub const METADATA_MIN_SIZE: u64 = 8 + DENTRY_DISK_SIZE;

fn invalid(offset: u64, msg: impl Into<String>) -> WimError {
    WimError::InvalidMetadataResource {
        offset,
        msg: msg.into(),
    }
}

/// Parse a metadata resource into an image.
///
/// `expected_hash` is the SHA-1 recorded for the resource; pass `None` when
/// the hash is known-fresh and should not be rechecked. The returned image
/// has an empty unhashed-blob list; stream payloads are resolved through the
/// blob table by hash.
pub fn read_metadata_resource(buf: &[u8], expected_hash: Option<&Sha1Hash>) -> Result<Image> {
    if (buf.len() as u64) < METADATA_MIN_SIZE {
        return Err(invalid(
            0,
            format!("expected at least {METADATA_MIN_SIZE} bytes for the metadata resource"),
        ));
    }

    if let Some(expected) = expected_hash {
        if sha1_buffer(buf) != *expected {
            return Err(invalid(
                0,
                "metadata resource is corrupted (invalid SHA-1 message digest)",
            ));
        }
    }

    let (security, sd_len) = SecurityData::parse(buf)?;

    let mut image = Image::new();
    image.security = security;

    // The root dentry starts right after the (8-aligned) security data.
    let root_offset = sd_len as u64;
    let root_dd = match read_dentry(buf, root_offset)? {
        Some(dd) => dd,
        None => {
            warn!("metadata resource begins with end-of-directory entry (treating as empty image)");
            return Ok(image);
        }
    };

    let mut root_dd = root_dd;
    if !root_dd.name.is_empty() || !root_dd.short_name.is_empty() {
        warn!("the root directory has a nonempty name (removing it)");
        root_dd.name.clear();
        root_dd.short_name.clear();
    }
    if root_dd.attributes & FILE_ATTRIBUTE_DIRECTORY == 0 {
        return Err(invalid(root_offset, "root of the WIM image must be a directory"));
    }

    // Every dentry's byte range must be unique; the security block is
    // claimed up front so no subdir offset can point into it.
    let mut claimed: BTreeMap<u64, u64> = BTreeMap::new();
    claimed.insert(0, root_offset);
    claim(&mut claimed, root_offset, root_offset + root_dd.length)?;

    let root_subdir = root_dd.subdir_offset;
    let root = instantiate(&mut image, root_dd);
    image.root = Some(root);

    // Read the child lists iteratively, pre-order; each list is terminated
    // by a zero length field.
    let mut pending: Vec<(DentryId, u64)> = Vec::new();
    if root_subdir != 0 {
        pending.push((root, root_subdir));
    }
    while let Some((parent, first_child)) = pending.pop() {
        let mut offset = first_child;
        loop {
            let dd = match read_dentry(buf, offset)? {
                Some(dd) => dd,
                None => break,
            };
            claim(&mut claimed, offset, offset + dd.length)?;
            let next = offset + dd.length;
            let subdir = dd.subdir_offset;
            let is_dir = dd.attributes & FILE_ATTRIBUTE_DIRECTORY != 0;
            let child = instantiate(&mut image, dd);
            image.add_child(parent, child);
            if is_dir && subdir != 0 {
                pending.push((child, subdir));
            }
            offset = next;
        }
    }

    // Collapse hard-link groups into shared inodes and rebuild link counts.
    fix_inodes(&mut image);

    for inode in &image.inodes {
        if inode.security_id != crate::image::SECURITY_ID_NONE
            && !image.security.contains_id(inode.security_id)
        {
            return Err(invalid(
                0,
                format!(
                    "inode references security ID {} outside the table of {} entries",
                    inode.security_id,
                    image.security.num_entries()
                ),
            ));
        }
    }

    debug!(
        "read metadata resource: {} dentries, {} inodes, {} security descriptors",
        image.preorder_ids().len(),
        image.inodes.len(),
        image.security.num_entries()
    );
    Ok(image)
}

/// Record `[start, end)` as consumed, failing on any overlap with a
/// previously claimed range. This is what makes cyclic or self-overlapping
/// subdir offsets a hard error instead of an infinite loop.
fn claim(claimed: &mut BTreeMap<u64, u64>, start: u64, end: u64) -> Result<()> {
    if let Some((_, &prev_end)) = claimed.range(..=start).next_back() {
        if prev_end > start {
            return Err(invalid(start, "dentry overlaps a previously read dentry"));
        }
    }
    if let Some((&next_start, _)) = claimed.range(start..).next() {
        if next_start < end {
            return Err(invalid(start, "dentry overlaps a previously read dentry"));
        }
    }
    claimed.insert(start, end);
    Ok(())
}

/// Turn a decoded dentry into an image dentry with its own provisional
/// inode; hard-link groups are collapsed afterwards.
fn instantiate(image: &mut Image, dd: DiskDentry) -> DentryId {
    let mut inode = Inode::new(dd.hard_link_group_id);
    inode.attributes = dd.attributes;
    inode.security_id = dd.security_id;
    inode.creation_time = dd.creation_time;
    inode.last_access_time = dd.last_access_time;
    inode.last_write_time = dd.last_write_time;
    inode.reparse_tag = dd.reparse_tag;
    inode.not_rpfixed = dd.not_rpfixed;

    if dd.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
        // A reparse point always owns exactly one reparse stream; the header
        // hash is that stream's.
        inode.streams.push(Stream {
            stream_type: StreamType::ReparsePoint,
            name: Vec::new(),
            hash: dd.unnamed_hash,
            blob: None,
        });
    } else if dd.unnamed_hash != ZERO_HASH {
        inode.streams.push(Stream {
            stream_type: StreamType::Data,
            name: Vec::new(),
            hash: dd.unnamed_hash,
            blob: None,
        });
    }
    for (name, hash) in dd.ads {
        inode.streams.push(Stream {
            stream_type: StreamType::Data,
            name,
            hash,
            blob: None,
        });
    }

    let iid = image.new_inode(inode);
    let id = image.new_dentry(dd.name, iid);
    image.dentry_mut(id).short_name = dd.short_name;
    id
}

/// Serialize an image into a metadata resource buffer, ready for the
/// compressed-resource writer. An image without a root gets an empty filler
/// root directory first. After the external writer stores the buffer, the
/// freshly computed hash becomes authoritative and re-verification should be
/// skipped (pass `None` to [`read_metadata_resource`]).
pub fn write_metadata_resource(image: &mut Image) -> Result<Vec<u8>> {
    if image.root.is_none() {
        debug!("image has no root; creating an empty filler directory");
        let now = filetime_now();
        let mut inode = Inode::new(0);
        inode.attributes = FILE_ATTRIBUTE_DIRECTORY;
        inode.creation_time = now;
        inode.last_write_time = now;
        inode.last_access_time = now;
        let iid = image.new_inode(inode);
        let root = image.new_dentry(Vec::new(), iid);
        image.root = Some(root);
    }
    let root = image.root.expect("root just ensured");

    for id in image.preorder_ids() {
        let dentry = image.dentry(id);
        if dentry.name.len() * 2 > u16::MAX as usize
            || dentry.short_name.len() * 2 > u16::MAX as usize
        {
            return Err(WimError::InvalidParam(format!(
                "dentry name \"{}\" does not fit the on-disk length field",
                utf16_display(&dentry.name)
            )));
        }
    }

    // Offset of the root's first child: the security data, the root dentry,
    // and one end-of-directory entry after the root.
    let sd_len = image.security.total_length();
    let mut cursor = sd_len + dentry_out_total_length(image, root) + 8;
    let mut offsets: HashMap<DentryId, u64> = HashMap::new();
    assign_subdir_offsets(image, root, &mut cursor, &mut offsets);
    let total_len = cursor;

    let group_ids = assign_link_group_ids(image);

    let mut buf = Vec::with_capacity(total_len as usize);
    image.security.write_to(&mut buf);
    debug_assert_eq!(buf.len() as u64, sd_len);

    write_dentry(image, root, offsets[&root], group_ids[image.dentry(root).inode.0], &mut buf);
    buf.extend_from_slice(&[0u8; 8]);
    emit_children(image, root, &offsets, &group_ids, &mut buf);

    // The offset assignment and the emission passes must agree exactly.
    assert_eq!(buf.len() as u64, total_len);
    Ok(buf)
}

/// Pre-order subdir offset assignment. Every directory, including an empty
/// one, gets an offset and an 8-byte end-of-directory entry; files get 0.
fn assign_subdir_offsets(
    image: &Image,
    dentry: DentryId,
    cursor: &mut u64,
    offsets: &mut HashMap<DentryId, u64>,
) {
    offsets.insert(dentry, *cursor);
    for &child in &image.dentry(dentry).children {
        *cursor += dentry_out_total_length(image, child);
    }
    *cursor += 8;
    for &child in &image.dentry(dentry).children {
        if image.inode_of(child).is_directory() {
            assign_subdir_offsets(image, child, cursor, offsets);
        } else {
            offsets.insert(child, 0);
        }
    }
}

/// Hard-link group IDs, indexed like `image.inodes`: the inode number for
/// multiply linked inodes, 0 for unique ones. Inodes without a usable number
/// get synthetic IDs clear of the MFT number range.
fn assign_link_group_ids(image: &Image) -> Vec<u64> {
    image
        .inodes
        .iter()
        .enumerate()
        .map(|(index, inode)| {
            if inode.nlink > 1 {
                if inode.ino != 0 {
                    inode.ino
                } else {
                    0x8000_0000_0000_0000 | index as u64
                }
            } else {
                0
            }
        })
        .collect()
}

fn emit_children(
    image: &Image,
    parent: DentryId,
    offsets: &HashMap<DentryId, u64>,
    group_ids: &[u64],
    buf: &mut Vec<u8>,
) {
    debug_assert_eq!(buf.len() as u64, offsets[&parent]);
    for &child in &image.dentry(parent).children {
        write_dentry(image, child, offsets[&child], group_ids[image.dentry(child).inode.0], buf);
    }
    buf.extend_from_slice(&[0u8; 8]);
    for &child in &image.dentry(parent).children {
        if image.inode_of(child).is_directory() {
            emit_children(image, child, offsets, group_ids, buf);
        }
    }
}

