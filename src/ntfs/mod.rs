//! Read-only NTFS volume access.
//!
//! [`NtfsVolumeOps`] is the seam between the capture engine and the platform
//! NTFS library: everything the scanner needs from a mounted volume,
//! expressed as fallible operations keyed by MFT record number.
//! [`NtfsMounter`] produces such backends from device paths. The engine only
//! consumes these interfaces; it does not implement a volume driver.

use std::path::Path;

use crate::error::Result;

// File attribute flags, as stored in $STANDARD_INFORMATION.
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const FILE_ATTRIBUTE_TEMPORARY: u32 = 0x0000_0100;
pub const FILE_ATTRIBUTE_SPARSE_FILE: u32 = 0x0000_0200;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;
pub const FILE_ATTRIBUTE_COMPRESSED: u32 = 0x0000_0800;
pub const FILE_ATTRIBUTE_ENCRYPTED: u32 = 0x0000_4000;

// Reparse tags relevant to link handling.
pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// MFT record number of the root directory.
pub const ROOT_MFT_NO: u64 = 5;

/// First MFT record number available for ordinary files. Records below this
/// hold NTFS metafiles ($MFT, $Bitmap, $Secure, ...) which are never captured.
pub const FIRST_USER_MFT_NO: u64 = 24;

/// An MFT reference: 48-bit record number plus 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MftRef(pub u64);

impl MftRef {
    pub fn number(self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Reference to the volume's root directory.
    pub fn root() -> Self {
        MftRef(ROOT_MFT_NO)
    }
}

/// Attribute types the capture engine enumerates and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Data,
    ReparsePoint,
}

impl AttrType {
    /// The NTFS on-disk attribute type code.
    pub fn code(self) -> u32 {
        match self {
            AttrType::Data => 0x80,
            AttrType::ReparsePoint => 0xC0,
        }
    }
}

/// Namespace of a directory entry's file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl NameType {
    pub fn from_disk(byte: u8) -> Self {
        match byte & 0x03 {
            1 => NameType::Win32,
            2 => NameType::Dos,
            3 => NameType::Win32AndDos,
            _ => NameType::Posix,
        }
    }

    /// True for Win32 and Win32+DOS names (rather than POSIX or DOS-only).
    pub fn is_win32(self) -> bool {
        matches!(self, NameType::Win32 | NameType::Win32AndDos)
    }

    pub fn is_dos(self) -> bool {
        matches!(self, NameType::Dos | NameType::Win32AndDos)
    }
}

/// One name of one file, as yielded by directory enumeration.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File name in UTF-16LE code units.
    pub name: Vec<u16>,
    pub name_type: NameType,
    pub mref: MftRef,
}

/// Timestamps from $STANDARD_INFORMATION, in Windows FILETIME units
/// (100 ns intervals since 1601-01-01).
#[derive(Debug, Clone, Copy, Default)]
pub struct NtfsTimes {
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
}

/// One attribute of a requested type, as yielded by attribute enumeration.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    /// Attribute name in UTF-16LE code units; empty for the unnamed attribute.
    pub name: Vec<u16>,
    /// The attribute's payload length in bytes. This is the value length for
    /// resident attributes and the real (uncompressed, unallocated) data size
    /// for non-resident ones.
    pub value_length: u64,
}

/// Operations the capture engine needs from a read-only NTFS volume.
///
/// All operations are keyed by MFT record number and may fail. Implementations
/// are not required to be thread-safe; [`crate::volume::Volume`] serializes
/// access from concurrent readers.
pub trait NtfsVolumeOps: Send {
    /// File attribute flags for an inode, with `FILE_ATTRIBUTE_DIRECTORY`
    /// synthesized from the MFT record for directories.
    fn file_attributes(&mut self, mft_no: u64) -> Result<u32>;

    /// Creation/write/access timestamps for an inode.
    fn timestamps(&mut self, mft_no: u64) -> Result<NtfsTimes>;

    /// The inode's security descriptor in raw self-relative form, or `None`
    /// if the inode has no descriptor.
    fn security_descriptor(&mut self, mft_no: u64) -> Result<Option<Vec<u8>>>;

    /// All attributes of the given type on an inode, in MFT record order.
    fn attributes_of_type(&mut self, mft_no: u64, attr_type: AttrType) -> Result<Vec<AttrInfo>>;

    /// The logical cluster number of the attribute's first allocated extent.
    /// `None` when the attribute is resident or its first run is a hole.
    fn first_extent_lcn(
        &mut self,
        mft_no: u64,
        attr_type: AttrType,
        attr_name: &[u16],
    ) -> Result<Option<u64>>;

    /// Read attribute payload bytes starting at `offset` into `buf`, returning
    /// the number of bytes read. A short count means the attribute ended.
    fn read_attribute(
        &mut self,
        mft_no: u64,
        attr_type: AttrType,
        attr_name: &[u16],
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Enumerate a directory's entries in NTFS directory order. Every name of
    /// every child is yielded, including DOS-only names.
    fn read_dir(&mut self, mft_no: u64) -> Result<Vec<DirEntry>>;
}

/// Mounts a device read-only, producing a volume backend.
///
/// Implemented by the binding to the platform NTFS library. Captures that
/// start from a device path go through this; captures that already hold a
/// backend wrap it in a [`crate::volume::Volume`] directly.
pub trait NtfsMounter {
    fn mount_readonly(&self, device: &Path) -> Result<Box<dyn NtfsVolumeOps>>;
}
