//! On-disk encoding of directory entries.
//!
//! A dentry is a 102-byte little-endian header, the UTF-16LE long and short
//! names (each NUL-terminated when present), zero padding to 8 bytes, then
//! one length-prefixed entry per named data stream. The header's `length`
//! field covers the header, names, and padding; stream entries carry their
//! own lengths. A `length` of 0 terminates a sibling list.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Result, WimError};
use crate::image::{Dentry, Image, Inode, Sha1Hash, Stream, ZERO_HASH};
use crate::ntfs::FILE_ATTRIBUTE_REPARSE_POINT;

/// Size of the fixed dentry header.
pub const DENTRY_DISK_SIZE: u64 = 102;
/// Size of the fixed part of an alternate-stream entry.
pub const ADS_ENTRY_DISK_SIZE: u64 = 38;

pub(crate) fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

fn invalid(offset: u64, msg: impl Into<String>) -> WimError {
    WimError::InvalidMetadataResource {
        offset,
        msg: msg.into(),
    }
}

/// Header + names, unaligned.
fn dentry_len_unaligned(dentry: &Dentry) -> u64 {
    let mut len = DENTRY_DISK_SIZE;
    if !dentry.name.is_empty() {
        len += dentry.name.len() as u64 * 2 + 2;
    }
    if !dentry.short_name.is_empty() {
        len += dentry.short_name.len() as u64 * 2 + 2;
    }
    len
}

/// The value of the on-disk `length` field: header + names, 8-aligned.
pub(crate) fn dentry_len_aligned(dentry: &Dentry) -> u64 {
    align8(dentry_len_unaligned(dentry))
}

fn ads_entry_len(stream: &Stream) -> u64 {
    let name_bytes = if stream.name.is_empty() {
        0
    } else {
        stream.name.len() as u64 * 2 + 2
    };
    align8(ADS_ENTRY_DISK_SIZE + name_bytes)
}

/// Full on-disk footprint of one dentry: aligned header + names plus all of
/// its inode's alternate-stream entries. Sibling dentries are laid out at
/// this distance.
pub(crate) fn dentry_out_total_length(image: &Image, id: crate::image::DentryId) -> u64 {
    let dentry = image.dentry(id);
    let inode = image.inode(dentry.inode);
    dentry_len_aligned(dentry)
        + inode
            .named_data_streams()
            .map(ads_entry_len)
            .sum::<u64>()
}

/// The hash stored in the dentry header: the reparse stream's for a reparse
/// point, otherwise the unnamed data stream's.
fn header_hash(inode: &Inode) -> Sha1Hash {
    let stream = if inode.is_reparse_point() {
        inode.reparse_stream()
    } else {
        inode.unnamed_data_stream()
    };
    stream.map_or(ZERO_HASH, |s| s.hash)
}

fn write_utf16_z(out: &mut Vec<u8>, units: &[u16]) {
    for unit in units {
        out.write_u16::<LittleEndian>(*unit).unwrap();
    }
    out.write_u16::<LittleEndian>(0).unwrap();
}

fn pad_to_8(out: &mut Vec<u8>, start: usize) {
    while (out.len() - start) % 8 != 0 {
        out.push(0);
    }
}

/// Append one dentry (header, names, stream entries) to `out`.
pub(crate) fn write_dentry(
    image: &Image,
    id: crate::image::DentryId,
    subdir_offset: u64,
    link_group_id: u64,
    out: &mut Vec<u8>,
) {
    let dentry = image.dentry(id);
    let inode = image.inode(dentry.inode);
    let start = out.len();

    out.write_u64::<LittleEndian>(dentry_len_aligned(dentry)).unwrap();
    out.write_u32::<LittleEndian>(inode.attributes).unwrap();
    out.write_i32::<LittleEndian>(inode.security_id).unwrap();
    out.write_u64::<LittleEndian>(subdir_offset).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap(); // unused_1
    out.write_u64::<LittleEndian>(0).unwrap(); // unused_2
    out.write_u64::<LittleEndian>(inode.creation_time).unwrap();
    out.write_u64::<LittleEndian>(inode.last_access_time).unwrap();
    out.write_u64::<LittleEndian>(inode.last_write_time).unwrap();
    out.extend_from_slice(&header_hash(inode));

    if inode.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
        out.write_u32::<LittleEndian>(0).unwrap(); // reparse_reserved
        out.write_u32::<LittleEndian>(inode.reparse_tag).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(inode.not_rpfixed).unwrap();
    } else {
        out.write_u32::<LittleEndian>(0).unwrap(); // reparse_reserved
        out.write_u64::<LittleEndian>(link_group_id).unwrap();
    }

    let num_ads = inode.named_data_streams().count() as u16;
    out.write_u16::<LittleEndian>(num_ads).unwrap();
    out.write_u16::<LittleEndian>((dentry.short_name.len() * 2) as u16)
        .unwrap();
    out.write_u16::<LittleEndian>((dentry.name.len() * 2) as u16)
        .unwrap();

    if !dentry.name.is_empty() {
        write_utf16_z(out, &dentry.name);
    }
    if !dentry.short_name.is_empty() {
        write_utf16_z(out, &dentry.short_name);
    }
    pad_to_8(out, start);
    debug_assert_eq!((out.len() - start) as u64, dentry_len_aligned(dentry));

    for stream in inode.named_data_streams() {
        let entry_start = out.len();
        out.write_u64::<LittleEndian>(ads_entry_len(stream)).unwrap();
        out.write_u64::<LittleEndian>(0).unwrap(); // reserved
        out.extend_from_slice(&stream.hash);
        out.write_u16::<LittleEndian>((stream.name.len() * 2) as u16)
            .unwrap();
        if !stream.name.is_empty() {
            write_utf16_z(out, &stream.name);
        }
        pad_to_8(out, entry_start);
    }
}

/// A decoded on-disk dentry, before inode reconstruction.
#[derive(Debug)]
pub(crate) struct DiskDentry {
    /// Total on-disk footprint, including stream entries; the next sibling
    /// starts this many bytes after this dentry.
    pub length: u64,
    pub attributes: u32,
    pub security_id: i32,
    pub subdir_offset: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub unnamed_hash: Sha1Hash,
    pub reparse_tag: u32,
    pub not_rpfixed: u16,
    pub hard_link_group_id: u64,
    pub name: Vec<u16>,
    pub short_name: Vec<u16>,
    /// Alternate-stream entries: (name, hash) in on-disk order.
    pub ads: Vec<(Vec<u16>, Sha1Hash)>,
}

fn read_utf16(buf: &[u8], offset: usize, nbytes: usize) -> Vec<u16> {
    (0..nbytes / 2)
        .map(|i| u16::from_le_bytes([buf[offset + i * 2], buf[offset + i * 2 + 1]]))
        .collect()
}

/// Decode the dentry at `offset`. Returns `None` for an end-of-directory
/// sentinel (length field 0).
pub(crate) fn read_dentry(buf: &[u8], offset: u64) -> Result<Option<DiskDentry>> {
    let at = |rel: u64| (offset + rel) as usize;

    if offset + 8 > buf.len() as u64 {
        return Err(invalid(offset, "dentry length field past end of resource"));
    }
    let length = u64::from_le_bytes(buf[at(0)..at(8)].try_into().unwrap());
    if length == 0 {
        return Ok(None);
    }
    if length < DENTRY_DISK_SIZE {
        return Err(invalid(offset, format!("dentry length {length} too small")));
    }
    if offset + length > buf.len() as u64 {
        return Err(invalid(offset, "dentry overruns resource"));
    }

    let attributes = u32::from_le_bytes(buf[at(8)..at(12)].try_into().unwrap());
    let security_id = i32::from_le_bytes(buf[at(12)..at(16)].try_into().unwrap());
    let subdir_offset = u64::from_le_bytes(buf[at(16)..at(24)].try_into().unwrap());
    let creation_time = u64::from_le_bytes(buf[at(40)..at(48)].try_into().unwrap());
    let last_access_time = u64::from_le_bytes(buf[at(48)..at(56)].try_into().unwrap());
    let last_write_time = u64::from_le_bytes(buf[at(56)..at(64)].try_into().unwrap());
    let mut unnamed_hash = ZERO_HASH;
    unnamed_hash.copy_from_slice(&buf[at(64)..at(84)]);

    let (reparse_tag, not_rpfixed, hard_link_group_id);
    if attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
        reparse_tag = u32::from_le_bytes(buf[at(88)..at(92)].try_into().unwrap());
        not_rpfixed = u16::from_le_bytes(buf[at(94)..at(96)].try_into().unwrap());
        hard_link_group_id = 0;
    } else {
        reparse_tag = 0;
        not_rpfixed = 0;
        hard_link_group_id = u64::from_le_bytes(buf[at(88)..at(96)].try_into().unwrap());
    }

    let num_ads = u16::from_le_bytes(buf[at(96)..at(98)].try_into().unwrap());
    let short_name_nbytes = u16::from_le_bytes(buf[at(98)..at(100)].try_into().unwrap()) as u64;
    let file_name_nbytes = u16::from_le_bytes(buf[at(100)..at(102)].try_into().unwrap()) as u64;

    if file_name_nbytes % 2 != 0 || short_name_nbytes % 2 != 0 {
        return Err(invalid(offset + 98, "dentry has odd name length"));
    }
    let mut calculated = DENTRY_DISK_SIZE;
    if file_name_nbytes > 0 {
        calculated += file_name_nbytes + 2;
    }
    if short_name_nbytes > 0 {
        calculated += short_name_nbytes + 2;
    }
    if length < calculated {
        return Err(invalid(offset, "dentry length too small for its names"));
    }

    let name = read_utf16(buf, at(DENTRY_DISK_SIZE), file_name_nbytes as usize);
    let short_start = DENTRY_DISK_SIZE + if file_name_nbytes > 0 { file_name_nbytes + 2 } else { 0 };
    let short_name = read_utf16(buf, at(short_start), short_name_nbytes as usize);

    // Alternate-stream entries follow the 8-aligned dentry.
    let mut cursor = offset + align8(length);
    let mut ads = Vec::with_capacity(num_ads as usize);
    for _ in 0..num_ads {
        if cursor + ADS_ENTRY_DISK_SIZE > buf.len() as u64 {
            return Err(invalid(cursor, "alternate stream entry past end of resource"));
        }
        let e = cursor as usize;
        let entry_len = u64::from_le_bytes(buf[e..e + 8].try_into().unwrap());
        if entry_len < ADS_ENTRY_DISK_SIZE {
            return Err(invalid(cursor, format!("stream entry length {entry_len} too small")));
        }
        if cursor + entry_len > buf.len() as u64 {
            return Err(invalid(cursor, "alternate stream entry overruns resource"));
        }
        let mut hash = ZERO_HASH;
        hash.copy_from_slice(&buf[e + 16..e + 36]);
        let name_nbytes = u16::from_le_bytes([buf[e + 36], buf[e + 37]]) as u64;
        if name_nbytes % 2 != 0 || ADS_ENTRY_DISK_SIZE + name_nbytes > entry_len {
            return Err(invalid(cursor + 36, "stream entry name overruns its length"));
        }
        let stream_name = read_utf16(buf, e + 38, name_nbytes as usize);
        ads.push((stream_name, hash));
        cursor += align8(entry_len);
    }

    Ok(Some(DiskDentry {
        length: cursor - offset,
        attributes,
        security_id,
        subdir_offset,
        creation_time,
        last_access_time,
        last_write_time,
        unnamed_hash,
        reparse_tag,
        not_rpfixed,
        hard_link_group_id,
        name,
        short_name,
        ads,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{utf16, Image, Inode, StreamType};
    use crate::ntfs::FILE_ATTRIBUTE_NORMAL;

    fn image_with_file() -> (Image, crate::image::DentryId) {
        let mut image = Image::new();
        let mut inode = Inode::new(42);
        inode.attributes = FILE_ATTRIBUTE_NORMAL;
        inode.security_id = 3;
        inode.creation_time = 111;
        inode.last_access_time = 222;
        inode.last_write_time = 333;
        inode.streams.push(Stream {
            stream_type: StreamType::Data,
            name: Vec::new(),
            hash: [0xAB; 20],
            blob: None,
        });
        inode.streams.push(Stream {
            stream_type: StreamType::Data,
            name: utf16("ads one"),
            hash: [0xCD; 20],
            blob: None,
        });
        let iid = image.new_inode(inode);
        let id = image.new_dentry(utf16("file.bin"), iid);
        image.dentry_mut(id).short_name = utf16("FILE~1.BIN");
        (image, id)
    }

    #[test]
    fn test_round_trip_with_names_and_streams() {
        let (image, id) = image_with_file();
        let mut out = Vec::new();
        write_dentry(&image, id, 0, 77, &mut out);
        assert_eq!(out.len() as u64, dentry_out_total_length(&image, id));

        let dd = read_dentry(&out, 0).unwrap().unwrap();
        assert_eq!(dd.length, out.len() as u64);
        assert_eq!(dd.attributes, FILE_ATTRIBUTE_NORMAL);
        assert_eq!(dd.security_id, 3);
        assert_eq!(dd.hard_link_group_id, 77);
        assert_eq!(dd.creation_time, 111);
        assert_eq!(dd.last_access_time, 222);
        assert_eq!(dd.last_write_time, 333);
        assert_eq!(dd.unnamed_hash, [0xAB; 20]);
        assert_eq!(dd.name, utf16("file.bin"));
        assert_eq!(dd.short_name, utf16("FILE~1.BIN"));
        assert_eq!(dd.ads.len(), 1);
        assert_eq!(dd.ads[0].0, utf16("ads one"));
        assert_eq!(dd.ads[0].1, [0xCD; 20]);
    }

    #[test]
    fn test_reparse_dentry_overlays_group_id() {
        let mut image = Image::new();
        let mut inode = Inode::new(9);
        inode.attributes = FILE_ATTRIBUTE_REPARSE_POINT;
        inode.reparse_tag = 0xA000_000C;
        inode.not_rpfixed = 1;
        inode.streams.push(Stream {
            stream_type: StreamType::ReparsePoint,
            name: Vec::new(),
            hash: [0x11; 20],
            blob: None,
        });
        let iid = image.new_inode(inode);
        let id = image.new_dentry(utf16("link"), iid);

        let mut out = Vec::new();
        write_dentry(&image, id, 0, 9, &mut out);
        let dd = read_dentry(&out, 0).unwrap().unwrap();

        assert_eq!(dd.reparse_tag, 0xA000_000C);
        assert_eq!(dd.not_rpfixed, 1);
        assert_eq!(dd.hard_link_group_id, 0);
        assert_eq!(dd.unnamed_hash, [0x11; 20]);
    }

    #[test]
    fn test_sentinel_is_none() {
        let buf = [0u8; 8];
        assert!(read_dentry(&buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_rejects_short_lengths() {
        // length field says 50 bytes: below the fixed header size
        let mut buf = vec![0u8; 128];
        buf[0] = 50;
        assert!(read_dentry(&buf, 0).is_err());

        // length runs past the buffer
        let mut buf = vec![0u8; 64];
        buf[0] = 104;
        assert!(read_dentry(&buf, 0).is_err());

        // truncated length field
        let buf = vec![0u8; 4];
        assert!(read_dentry(&buf, 0).is_err());
    }

    #[test]
    fn test_rejects_names_exceeding_length() {
        let (image, id) = image_with_file();
        let mut out = Vec::new();
        write_dentry(&image, id, 0, 0, &mut out);
        // Claim a longer file name than the dentry length allows
        out[100] = 0xF0;
        assert!(read_dentry(&out, 0).is_err());
    }

    #[test]
    fn test_rejects_odd_name_length() {
        let (image, id) = image_with_file();
        let mut out = Vec::new();
        write_dentry(&image, id, 0, 0, &mut out);
        out[100] = 3;
        assert!(read_dentry(&out, 0).is_err());
    }

    #[test]
    fn test_rejects_truncated_stream_entry() {
        let (image, id) = image_with_file();
        let mut out = Vec::new();
        write_dentry(&image, id, 0, 0, &mut out);
        let aligned = dentry_len_aligned(image.dentry(id)) as usize;
        out.truncate(aligned + 10);
        assert!(read_dentry(&out, 0).is_err());
    }

    #[test]
    fn test_lengths_are_aligned() {
        let (image, id) = image_with_file();
        assert_eq!(dentry_len_aligned(image.dentry(id)) % 8, 0);
        assert_eq!(dentry_out_total_length(&image, id) % 8, 0);
    }
}
