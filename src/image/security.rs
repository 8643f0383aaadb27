//! The security-data block of a metadata resource and the deduplicating
//! descriptor set used during capture.
//!
//! On-wire layout (little-endian): a `u32` total length (header included,
//! padded to 8), a `u32` entry count, one `u64` size per descriptor, the raw
//! descriptors back to back, and zero padding to the 8-byte boundary.

use std::collections::HashMap;

use byteorder::{LittleEndian, WriteBytesExt};
use sha1::{Digest, Sha1};

use crate::error::{Result, WimError};

use super::Sha1Hash;

/// SHA-1 of a byte buffer.
pub fn sha1_buffer(buf: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(buf);
    hasher.finalize().into()
}

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// The raw Windows security descriptors of one image, referenced from inodes
/// by index.
#[derive(Debug, Default)]
pub struct SecurityData {
    descriptors: Vec<Vec<u8>>,
}

impl SecurityData {
    pub fn num_entries(&self) -> u32 {
        self.descriptors.len() as u32
    }

    pub fn descriptors(&self) -> &[Vec<u8>] {
        &self.descriptors
    }

    pub fn get(&self, id: i32) -> Option<&[u8]> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.descriptors.get(i))
            .map(Vec::as_slice)
    }

    /// Whether `id` is a valid descriptor index for this table.
    pub fn contains_id(&self, id: i32) -> bool {
        id >= 0 && (id as usize) < self.descriptors.len()
    }

    /// Serialized length of the block, including header and padding.
    pub fn total_length(&self) -> u64 {
        let n = self.descriptors.len() as u64;
        let payload: u64 = self.descriptors.iter().map(|d| d.len() as u64).sum();
        align8(8 + 8 * n + payload)
    }

    /// Append the on-wire block to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let total = self.total_length();
        out.write_u32::<LittleEndian>(total as u32).unwrap();
        out.write_u32::<LittleEndian>(self.num_entries()).unwrap();
        for d in &self.descriptors {
            out.write_u64::<LittleEndian>(d.len() as u64).unwrap();
        }
        for d in &self.descriptors {
            out.extend_from_slice(d);
        }
        while out.len() as u64 % 8 != 0 {
            out.push(0);
        }
    }

    /// Parse the block at the start of `buf`, returning the table and the
    /// number of bytes to advance (always a multiple of 8).
    ///
    /// A stored total length of 0 is accepted as an empty table of length 8.
    pub fn parse(buf: &[u8]) -> Result<(SecurityData, usize)> {
        let invalid = |offset: usize, msg: &str| WimError::InvalidMetadataResource {
            offset: offset as u64,
            msg: msg.into(),
        };

        if buf.len() < 8 {
            return Err(invalid(0, "security data header truncated"));
        }
        let total_length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as u64;
        let num_entries = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as u64;

        if total_length == 0 {
            return Ok((SecurityData::default(), 8));
        }

        let advance = align8(total_length);
        if total_length < 8 || advance > buf.len() as u64 {
            return Err(invalid(0, "security data length out of range"));
        }
        if 8 + num_entries * 8 > total_length {
            return Err(invalid(4, "security data entry count out of range"));
        }

        let mut sizes = Vec::with_capacity(num_entries as usize);
        let mut pos = 8usize;
        for _ in 0..num_entries {
            sizes.push(u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }

        let mut descriptors = Vec::with_capacity(num_entries as usize);
        for size in sizes {
            let end = (pos as u64).checked_add(size);
            match end {
                Some(end) if end <= total_length => {}
                _ => return Err(invalid(pos, "security descriptor overruns its table")),
            }
            descriptors.push(buf[pos..pos + size as usize].to_vec());
            pos += size as usize;
        }

        Ok((SecurityData { descriptors }, advance as usize))
    }
}

/// Deduplicating registry of security descriptors built during capture.
/// Byte-identical descriptors share one ID; IDs are assigned in first-seen
/// order and index straight into the resulting [`SecurityData`].
#[derive(Debug, Default)]
pub struct SdSet {
    data: SecurityData,
    index: HashMap<Sha1Hash, i32>,
}

impl SdSet {
    pub fn new() -> Self {
        SdSet::default()
    }

    /// Register a descriptor, returning its table ID.
    pub fn add(&mut self, descriptor: &[u8]) -> i32 {
        let key = sha1_buffer(descriptor);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.data.descriptors.len() as i32;
        self.data.descriptors.push(descriptor.to_vec());
        self.index.insert(key, id);
        id
    }

    pub fn num_entries(&self) -> u32 {
        self.data.num_entries()
    }

    pub fn into_security_data(self) -> SecurityData {
        self.data
    }
}
