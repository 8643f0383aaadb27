//! wimcap captures live NTFS volumes into WIM images and reads and writes
//! the WIM metadata resource.
//!
//! The two halves share one data model: a dentry tree ([`image::Image`])
//! over a deduplicated inode table, with deferred payloads
//! ([`blob::BlobDescriptor`]) pointing back into the source volume and a
//! deduplicating security descriptor set.
//!
//! - [`capture`] walks a mounted volume ([`volume::Volume`]) through the
//!   consumed platform interface ([`ntfs::NtfsVolumeOps`], produced by an
//!   [`ntfs::NtfsMounter`] binding), preserving named data streams, reparse
//!   points, hard links, DOS short names, security descriptors, and
//!   timestamps.
//! - [`metadata`] serializes an image into the metadata resource byte format
//!   and parses one back, byte-compatible with the Microsoft WIM layout.
//!
//! Chunked resource compression, the content-addressed blob table, the NTFS
//! volume driver itself, and extraction live elsewhere; this crate hands
//! buffers and blob descriptors across those seams.

pub mod blob;
pub mod capture;
pub mod error;
pub mod image;
pub mod metadata;
pub mod ntfs;
pub mod volume;

pub use blob::BlobDescriptor;
pub use capture::{capture_device, capture_volume, CaptureHooks, CaptureOptions};
pub use error::{Result, WimError};
pub use image::Image;
pub use metadata::{read_metadata_resource, write_metadata_resource};
pub use volume::Volume;
