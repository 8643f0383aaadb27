//! The in-memory WIM image: a dentry tree over a shared inode table, plus
//! security data and the list of not-yet-hashed payloads.

pub mod fixup;
pub mod security;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::blob::BlobDescriptor;
use crate::ntfs::{
    FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_REPARSE_POINT, IO_REPARSE_TAG_MOUNT_POINT,
    IO_REPARSE_TAG_SYMLINK,
};

use self::security::SecurityData;

/// Sentinel security ID meaning "no security descriptor".
pub const SECURITY_ID_NONE: i32 = -1;

/// Reparse flag: the target path has not been adjusted for the capture root.
pub const REPARSE_FLAG_NOT_FIXED: u16 = 0x0001;

/// SHA-1 message digest of a blob's contents.
pub type Sha1Hash = [u8; 20];

pub const ZERO_HASH: Sha1Hash = [0; 20];

/// Index of a dentry within an [`Image`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryId(pub(crate) usize);

/// Index of an inode within an [`Image`]'s inode list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub(crate) usize);

/// Kind of data a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Data,
    ReparsePoint,
    Unknown,
}

/// One stream of an inode: the default unnamed data stream, a named
/// alternate data stream, or the reparse point stream.
#[derive(Debug, Clone)]
pub struct Stream {
    pub stream_type: StreamType,
    /// Stream name in UTF-16 code units; empty for the unnamed stream.
    pub name: Vec<u16>,
    /// Content hash; all zeroes while the payload is unhashed or the stream
    /// is empty.
    pub hash: Sha1Hash,
    /// Deferred payload; `None` for an empty stream or when the image came
    /// from a metadata resource (payloads then live in the blob table).
    pub blob: Option<BlobDescriptor>,
}

impl Stream {
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn is_unnamed_data(&self) -> bool {
        self.stream_type == StreamType::Data && self.name.is_empty()
    }
}

/// One file object, possibly referenced by several dentries (hard links).
#[derive(Debug)]
pub struct Inode {
    /// Volume inode number (MFT record number) or hard-link group ID.
    pub ino: u64,
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
    pub attributes: u32,
    pub reparse_tag: u32,
    pub not_rpfixed: u16,
    /// Index into the image's security data, or [`SECURITY_ID_NONE`].
    pub security_id: i32,
    /// Number of dentries in the tree referring to this inode.
    pub nlink: u32,
    /// Streams in NTFS attribute enumeration order.
    pub streams: Vec<Stream>,
}

impl Inode {
    pub fn new(ino: u64) -> Self {
        Inode {
            ino,
            creation_time: 0,
            last_write_time: 0,
            last_access_time: 0,
            attributes: 0,
            reparse_tag: 0,
            not_rpfixed: 0,
            security_id: SECURITY_ID_NONE,
            nlink: 0,
            streams: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    /// Symbolic links and junction points get reparse-target fixups.
    pub fn is_symlink(&self) -> bool {
        self.is_reparse_point()
            && (self.reparse_tag == IO_REPARSE_TAG_SYMLINK
                || self.reparse_tag == IO_REPARSE_TAG_MOUNT_POINT)
    }

    /// The unnamed data stream, if present.
    pub fn unnamed_data_stream(&self) -> Option<&Stream> {
        self.streams.iter().find(|s| s.is_unnamed_data())
    }

    /// The reparse point stream, if present.
    pub fn reparse_stream(&self) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|s| s.stream_type == StreamType::ReparsePoint)
    }

    /// Named data streams, in stream order. These become the dentry's
    /// alternate-stream entries on disk.
    pub fn named_data_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams
            .iter()
            .filter(|s| s.stream_type == StreamType::Data && s.is_named())
    }
}

/// A directory entry: one name of one inode under one parent.
#[derive(Debug)]
pub struct Dentry {
    /// Long name in UTF-16 code units; empty for the root.
    pub name: Vec<u16>,
    /// DOS 8.3 short name in UTF-16 code units; usually empty.
    pub short_name: Vec<u16>,
    pub inode: InodeId,
    /// `None` only for the root.
    pub parent: Option<DentryId>,
    /// Children in NTFS directory order.
    pub children: Vec<DentryId>,
    /// Set when the dentry was reached through a Win32 (not POSIX) name.
    pub is_win32_name: bool,
}

/// In-memory metadata of one WIM image.
#[derive(Debug, Default)]
pub struct Image {
    dentries: Vec<Dentry>,
    pub inodes: Vec<Inode>,
    pub root: Option<DentryId>,
    pub security: SecurityData,
    /// Payloads discovered during capture whose hashes are still pending.
    pub unhashed_blobs: Vec<BlobDescriptor>,
}

impl Image {
    pub fn new() -> Self {
        Image::default()
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0]
    }

    pub fn dentry_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.dentries[id.0]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn inode_of(&self, dentry: DentryId) -> &Inode {
        self.inode(self.dentry(dentry).inode)
    }

    pub fn new_inode(&mut self, inode: Inode) -> InodeId {
        self.inodes.push(inode);
        InodeId(self.inodes.len() - 1)
    }

    /// Allocate a dentry bound to `inode`, bumping its link count.
    pub fn new_dentry(&mut self, name: Vec<u16>, inode: InodeId) -> DentryId {
        self.inodes[inode.0].nlink += 1;
        self.dentries.push(Dentry {
            name,
            short_name: Vec::new(),
            inode,
            parent: None,
            children: Vec::new(),
            is_win32_name: false,
        });
        DentryId(self.dentries.len() - 1)
    }

    /// Append `child` to `parent`'s ordered child list.
    pub fn add_child(&mut self, parent: DentryId, child: DentryId) {
        self.dentries[child.0].parent = Some(parent);
        self.dentries[parent.0].children.push(child);
    }

    /// Dentry IDs of the subtree rooted at `start`, in pre-order.
    pub fn subtree_ids(&self, start: DentryId) -> Vec<DentryId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &child in self.dentries[id.0].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// All reachable dentry IDs, root first, in pre-order.
    pub fn preorder_ids(&self) -> Vec<DentryId> {
        match self.root {
            Some(root) => self.subtree_ids(root),
            None => Vec::new(),
        }
    }

    /// Drop inodes no longer referenced by any reachable dentry and rebuild
    /// link counts. Dentry slots orphaned by a discarded subtree are left in
    /// the arena; they are unreachable and carry no inode reference after
    /// this pass.
    pub fn compact_inodes(&mut self) {
        let reachable = self.preorder_ids();
        let mut remap: Vec<Option<InodeId>> = vec![None; self.inodes.len()];
        let mut kept: Vec<Inode> = Vec::new();

        for &id in &reachable {
            let old = self.dentries[id.0].inode;
            let new = match remap[old.0] {
                Some(new) => new,
                None => {
                    let mut inode = std::mem::replace(&mut self.inodes[old.0], Inode::new(0));
                    inode.nlink = 0;
                    kept.push(inode);
                    let new = InodeId(kept.len() - 1);
                    remap[old.0] = Some(new);
                    new
                }
            };
            self.dentries[id.0].inode = new;
            kept[new.0].nlink += 1;
        }

        self.inodes = kept;
    }
}

/// Encode a string as UTF-16 code units.
pub fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Lossy decode of UTF-16 code units for diagnostics.
pub fn utf16_display(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// The current time as a Windows FILETIME (100 ns intervals since
/// 1601-01-01 00:00:00 UTC).
pub fn filetime_now() -> u64 {
    // Seconds between 1601-01-01 and the Unix epoch
    const EPOCH_DELTA_SECS: u64 = 11_644_473_600;
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (EPOCH_DELTA_SECS + since_unix.as_secs()) * 10_000_000 + since_unix.subsec_nanos() as u64 / 100
}
