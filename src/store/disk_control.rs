//! On-disk record framing.
//!
//! Every record starts with a fixed 96-byte *disk control* header,
//! stored twice: at the record's start in the data file and as one
//! slot of the compact index file. The two copies must stay byte
//! identical for a live record. All multi-byte fields are
//! little-endian on disk; serialization is explicit per field, so big
//! endian hosts get the swap for free.

use std::convert::TryInto;
use std::fmt;

use crate::store::error::{Error, Result};

/// Size of a record key in bytes.
pub const KEY_SIZE: usize = 64;

/// Size of the serialized disk-control header.
pub const DISK_CONTROL_SIZE: usize = 96;

/// A fixed-width opaque record identifier.
///
/// Ordering is lexicographic over the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Derive a key by hashing arbitrary caller bytes with SHA-512.
    pub fn hashed(data: &[u8]) -> Self {
        Key(openssl::sha::sha512(data))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(12);
        for b in &self.0[..6] {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({}...)", self.dump())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.dump())
    }
}

bitflags::bitflags! {
    /// Record flag bits as stored in the disk-control header.
    ///
    /// Bits 16..64 are reserved for embedders and round-trip through
    /// the store untouched.
    pub struct DcFlags: u64 {
        /// Logically deleted; skipped by lookups and iteration.
        const REMOVED = 0x01;
        /// Written without checksum footers.
        const NOCSUM = 0x02;
        /// Uses the per-chunk CRC32 footer layout.
        const CHUNKED_CSUM = 1 << 8;
        /// A previous verification of this record failed.
        const CORRUPTED = 1 << 9;
        /// Embedder defined bits.
        const USER = 0xffff_ffff_ffff_0000;
    }
}

impl DcFlags {
    /// Internal bits a caller may not set on write.
    pub(crate) fn sanitize_user(self) -> DcFlags {
        self & (DcFlags::USER | DcFlags::NOCSUM)
    }
}

/// The fixed-size per-record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskControl {
    pub key: Key,
    pub flags: DcFlags,
    /// Payload bytes committed by the writer.
    pub data_size: u64,
    /// Payload + padding + footers, aligned.
    pub disk_size: u64,
    /// Offset of this header within its data file.
    pub offset: u64,
}

impl DiskControl {
    pub fn to_bytes(&self) -> [u8; DISK_CONTROL_SIZE] {
        let mut buf = [0u8; DISK_CONTROL_SIZE];
        buf[0..64].copy_from_slice(&self.key.0);
        buf[64..72].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[72..80].copy_from_slice(&self.data_size.to_le_bytes());
        buf[80..88].copy_from_slice(&self.disk_size.to_le_bytes());
        buf[88..96].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DISK_CONTROL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "disk control needs {} bytes, got {}",
                DISK_CONTROL_SIZE,
                buf.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&buf[0..64]);
        Ok(Self {
            key: Key(key),
            flags: DcFlags::from_bits_truncate(u64::from_le_bytes(
                buf[64..72].try_into().unwrap(),
            )),
            data_size: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            disk_size: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[88..96].try_into().unwrap()),
        })
    }

    pub fn is_removed(&self) -> bool {
        self.flags.contains(DcFlags::REMOVED)
    }

    pub fn is_corrupted(&self) -> bool {
        self.flags.contains(DcFlags::CORRUPTED)
    }

    pub fn is_nocsum(&self) -> bool {
        self.flags.contains(DcFlags::NOCSUM)
    }

    pub fn has_chunked_csum(&self) -> bool {
        self.flags.contains(DcFlags::CHUNKED_CSUM)
    }

    /// Offset of the payload within the data file.
    pub fn data_offset(&self) -> u64 {
        self.offset + DISK_CONTROL_SIZE as u64
    }
}

/// Round `size` up to a multiple of `alignment` (a power of two or
/// any positive value; plain integer arithmetic, no bit tricks).
pub fn align_up(size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return size;
    }
    match size % alignment {
        0 => size,
        rem => size + (alignment - rem),
    }
}

/// Aligned on-disk size of a record with `payload_span` payload bytes
/// and `footer_bytes` of checksum footers.
pub fn aligned_disk_size(payload_span: u64, footer_bytes: u64, alignment: u64) -> u64 {
    align_up(
        DISK_CONTROL_SIZE as u64 + payload_span + footer_bytes,
        alignment,
    )
}

/// Placement of one record, as returned by write/lookup operations.
///
/// Offsets are absolute within the owning base's files.
#[derive(Clone, Copy, Debug)]
pub struct WriteControl {
    /// Number of the base holding the record.
    pub base_index: u64,
    pub flags: DcFlags,
    /// Bytes touched by the operation that produced this control.
    pub size: u64,
    /// Payload offset touched by that operation.
    pub offset: u64,
    /// Full committed payload size of the record.
    pub total_data_size: u64,
    /// Full on-disk size of the record after the header.
    pub total_size: u64,
    /// Offset of the disk-control header in the data file.
    pub ctl_data_offset: u64,
    /// Offset of the disk-control slot in the index file.
    pub ctl_index_offset: u64,
    /// Offset of the payload in the data file.
    pub data_offset: u64,
}

impl WriteControl {
    pub(crate) fn from_dc(dc: &DiskControl, base_index: u64, ctl_index_offset: u64) -> Self {
        Self {
            base_index,
            flags: dc.flags,
            size: dc.data_size,
            offset: 0,
            total_data_size: dc.data_size,
            total_size: dc.disk_size,
            ctl_data_offset: dc.offset,
            ctl_index_offset,
            data_offset: dc.data_offset(),
        }
    }
}
