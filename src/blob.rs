//! Deferred file payloads.
//!
//! A [`BlobDescriptor`] records where a stream's data lives without reading
//! it; the hashing and writing pipeline reads it later, ideally in on-disk
//! order via [`BlobDescriptor::cmp_by_position`].

use std::cmp::Ordering;

use crate::error::{Result, WimError};
use crate::ntfs::AttrType;
use crate::volume::Volume;

/// Chunk size for streaming blob reads.
pub const BLOB_READ_CHUNK: usize = 32 * 1024;

/// A reparse point attribute's payload begins after an 8-byte header
/// (reparse tag and data length) that WIM stores elsewhere.
pub const REPARSE_DATA_OFFSET: u64 = 8;

/// Position of a blob inside a mounted NTFS volume.
#[derive(Debug, Clone)]
pub struct NtfsLocation {
    pub volume: Volume,
    pub mft_no: u64,
    pub attr_type: AttrType,
    /// Attribute name in UTF-16 code units; empty for the unnamed attribute.
    pub attr_name: Vec<u16>,
    /// Starting LCN of the attribute's first allocated extent, or 0 when the
    /// attribute is resident or starts with a hole. Only used for read
    /// scheduling, not identity.
    pub sort_key: u64,
}

/// Where a blob's bytes live.
#[derive(Debug, Clone)]
pub enum BlobLocation {
    NtfsVolume(NtfsLocation),
}

/// An immutable handle to deferred file data.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    /// Payload size in bytes. For a reparse point attribute this excludes the
    /// 8-byte reparse header.
    pub size: u64,
    pub location: BlobLocation,
}

impl BlobDescriptor {
    pub fn in_ntfs_volume(loc: NtfsLocation, size: u64) -> Self {
        BlobDescriptor {
            size,
            location: BlobLocation::NtfsVolume(loc),
        }
    }

    fn ntfs_location(&self) -> &NtfsLocation {
        match &self.location {
            BlobLocation::NtfsVolume(loc) => loc,
        }
    }

    /// Position-based ordering for sequential volume reads: blobs compare by
    /// the starting LCN of their first extent. Ties (resident attributes,
    /// holes) are equal, which any stable sort leaves in discovery order.
    pub fn cmp_by_position(a: &BlobDescriptor, b: &BlobDescriptor) -> Ordering {
        a.ntfs_location().sort_key.cmp(&b.ntfs_location().sort_key)
    }

    /// Read the first `size` bytes of the referenced attribute in chunks,
    /// delivering each chunk to `sink`. For a reparse point attribute the
    /// read starts past the 8-byte reparse header. An error from `sink`
    /// stops the read and is returned as-is.
    pub fn read_prefix(
        &self,
        size: u64,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let loc = self.ntfs_location();
        let mut pos = match loc.attr_type {
            AttrType::ReparsePoint => REPARSE_DATA_OFFSET,
            _ => 0,
        };
        let mut remaining = size;
        let mut buf = [0u8; BLOB_READ_CHUNK];

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = loc.volume.with_ops(|ops| {
                ops.read_attribute(loc.mft_no, loc.attr_type, &loc.attr_name, pos, &mut buf[..want])
            })?;
            if got != want {
                return Err(WimError::VolumeRead {
                    mft_no: loc.mft_no,
                    msg: format!("short attribute read: wanted {want} bytes, got {got}"),
                });
            }
            pos += want as u64;
            remaining -= want as u64;
            sink(&buf[..want])?;
        }
        Ok(())
    }
}

/// Two descriptors are equal iff they refer to the same attribute of the same
/// inode on the same volume. The sort key is scheduling state, not identity.
impl PartialEq for BlobDescriptor {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.ntfs_location(), other.ntfs_location());
        Volume::same_volume(&a.volume, &b.volume)
            && a.mft_no == b.mft_no
            && a.attr_type == b.attr_type
            && a.attr_name == b.attr_name
    }
}

impl Eq for BlobDescriptor {}
