//! Record checksum footers.
//!
//! Payload is checksummed in fixed 1 MiB chunks. The footer region at
//! the end of a record holds one 4-byte CRC32 per chunk followed by a
//! 4-byte summary CRC32 computed over the per-chunk footers
//! themselves. The per-chunk checksums cover everything between the
//! header and the footer region, so alignment padding is protected
//! too.
//!
//! Records written by older store versions instead end in a single
//! 72-byte footer: a SHA-512 digest of the payload plus the record's
//! original offset. That layout is verified but never produced.

use std::fs::File;

use crate::store::disk_control::{DcFlags, WriteControl, DISK_CONTROL_SIZE};
use crate::store::error::{Error, Result};
use crate::tools::file::{read_all_at, write_all_at};

/// Payload bytes covered by one CRC32 footer.
pub const CSUM_CHUNK_SIZE: u64 = 1024 * 1024;

/// Size of one chunk footer (and of the summary footer).
pub const FOOTER_SIZE: u64 = 4;

/// Size of the legacy whole-record footer: SHA-512 + original offset.
pub const LEGACY_FOOTER_SIZE: u64 = 72;

const HEADER_SIZE: u64 = DISK_CONTROL_SIZE as u64;

/// Footer bytes to reserve for a record of `data_size` payload bytes.
///
/// One footer per (possibly short) chunk plus the summary footer.
pub fn footer_size(no_footer: bool, data_size: u64) -> u64 {
    if no_footer || data_size == 0 {
        return 0;
    }
    let footers = (data_size - 1) / CSUM_CHUNK_SIZE + 2;
    footers * FOOTER_SIZE
}

/// Offset of the footer region within the record, header included.
///
/// The region sits at the record's very end: one footer per payload
/// chunk plus the summary. Anchoring the chunk count on the committed
/// payload size keeps the layout well defined for any block
/// alignment, including payloads that are an exact chunk multiple.
pub fn footer_offset(wc: &WriteControl) -> u64 {
    if wc.flags.contains(DcFlags::CHUNKED_CSUM) {
        let chunks = (wc.total_data_size.max(1) - 1) / CSUM_CHUNK_SIZE + 1;
        wc.total_size - (chunks + 1) * FOOTER_SIZE
    } else {
        wc.total_size - LEGACY_FOOTER_SIZE
    }
}

/// Streaming CRC32 over `count` bytes of `file` starting at `offset`.
fn crc32_file(file: &File, mut offset: u64, mut count: u64) -> Result<u32> {
    const READ_BUFFER_SIZE: u64 = 64 * 1024;

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE.min(count.max(1)) as usize];
    while count > 0 {
        let step = READ_BUFFER_SIZE.min(count) as usize;
        read_all_at(file, &mut buf[..step], offset)?;
        hasher.update(&buf[..step]);
        offset += step as u64;
        count -= step as u64;
    }
    Ok(hasher.finalize())
}

/// Recompute the per-chunk footers covering payload range
/// `[offset, offset + size)`.
///
/// Returns the footer bytes and the absolute file offset they belong
/// at. The final chunk of a record is short; every chunk checksum
/// runs up to the footer region, padding included.
fn chunked_csum(file: &File, wc: &WriteControl, offset: u64, size: u64) -> Result<(Vec<u8>, u64)> {
    let first_chunk = offset / CSUM_CHUNK_SIZE;
    let last_chunk = (offset + size - 1) / CSUM_CHUNK_SIZE + 1;
    let footer_offset = footer_offset(wc);
    let footers_offset = wc.ctl_data_offset + footer_offset + first_chunk * FOOTER_SIZE;

    let record_chunks = (wc.total_data_size.max(1) - 1) / CSUM_CHUNK_SIZE + 1;
    let mut footers = Vec::with_capacity(((last_chunk - first_chunk) * FOOTER_SIZE) as usize);
    for chunk in first_chunk..last_chunk {
        let data_offset = wc.ctl_data_offset + HEADER_SIZE + chunk * CSUM_CHUNK_SIZE;
        let offset_max = wc.ctl_data_offset + footer_offset;
        // the record's final chunk runs all the way to the footer
        // region so the alignment padding is covered as well
        let data_size = if chunk == record_chunks - 1 {
            offset_max - data_offset
        } else {
            CSUM_CHUNK_SIZE.min(offset_max - data_offset)
        };
        let csum = crc32_file(file, data_offset, data_size)?;
        footers.extend_from_slice(&csum.to_le_bytes());
    }
    Ok((footers, footers_offset))
}

/// Write the full footer region of a freshly committed record.
pub fn commit(file: &File, wc: &WriteControl, no_footer: bool) -> Result<()> {
    if no_footer || wc.flags.contains(DcFlags::NOCSUM) || wc.total_data_size == 0 {
        return Ok(());
    }

    let (footers, footers_offset) = chunked_csum(file, wc, 0, wc.total_data_size)?;
    let summary = crc32fast::hash(&footers);

    write_all_at(file, &footers, footers_offset)?;
    write_all_at(
        file,
        &summary.to_le_bytes(),
        footers_offset + footers.len() as u64,
    )?;
    Ok(())
}

/// Rewrite the footers of the chunks touched by a partial update of
/// payload range `[offset, offset + size)`, then refresh the summary
/// footer over the whole footer region.
pub fn commit_range(
    file: &File,
    wc: &WriteControl,
    offset: u64,
    size: u64,
    no_footer: bool,
) -> Result<()> {
    if no_footer || wc.flags.contains(DcFlags::NOCSUM) || size == 0 {
        return Ok(());
    }

    let (footers, footers_offset) = chunked_csum(file, wc, offset, size)?;
    write_all_at(file, &footers, footers_offset)?;

    let region_offset = wc.ctl_data_offset + footer_offset(wc);
    let region_size = wc.total_size - footer_offset(wc) - FOOTER_SIZE;
    let summary = crc32_file(file, region_offset, region_size)?;
    write_all_at(file, &summary.to_le_bytes(), region_offset + region_size)?;
    Ok(())
}

/// Verify the chunked checksums covering payload range
/// `[offset, offset + size)`.
///
/// When the range spans the whole record the summary footer is
/// checked as well.
fn verify_chunked(file: &File, wc: &WriteControl, offset: u64, size: u64) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    let (calculated, footers_offset) = chunked_csum(file, wc, offset, size)?;
    let mut stored = vec![0u8; calculated.len()];
    read_all_at(file, &mut stored, footers_offset)?;

    if calculated != stored {
        log::debug!(
            "blob: checksum mismatch: footers_offset: {}, footers_size: {}",
            footers_offset,
            stored.len()
        );
        return Err(Error::ChecksumMismatch);
    }

    if offset == 0 && size == wc.total_data_size {
        let region_offset = wc.ctl_data_offset + footer_offset(wc);
        let region_size = wc.total_size - footer_offset(wc) - FOOTER_SIZE;
        let summary = crc32_file(file, region_offset, region_size)?;
        let mut stored_summary = [0u8; FOOTER_SIZE as usize];
        read_all_at(file, &mut stored_summary, region_offset + region_size)?;
        if summary.to_le_bytes() != stored_summary {
            return Err(Error::ChecksumMismatch);
        }
    }

    Ok(())
}

/// Verify the legacy single SHA-512 footer.
///
/// A zero-filled stored digest is accepted as "unchecked": such
/// records were written with checksumming disabled and stay
/// unprotected for their lifetime.
fn verify_legacy(file: &File, wc: &WriteControl) -> Result<()> {
    let footer_offset = wc.ctl_data_offset + wc.total_size - LEGACY_FOOTER_SIZE;
    let mut stored = [0u8; 64];
    read_all_at(file, &mut stored, footer_offset)?;

    if stored == [0u8; 64] {
        return Ok(());
    }

    const READ_BUFFER_SIZE: u64 = 64 * 1024;
    let mut hasher = openssl::sha::Sha512::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE as usize];
    let mut offset = wc.ctl_data_offset + HEADER_SIZE;
    let mut count = wc.total_data_size;
    while count > 0 {
        let step = READ_BUFFER_SIZE.min(count) as usize;
        read_all_at(file, &mut buf[..step], offset)?;
        hasher.update(&buf[..step]);
        offset += step as u64;
        count -= step as u64;
    }

    if hasher.finish() != stored {
        return Err(Error::ChecksumMismatch);
    }
    Ok(())
}

/// Verify the checksums of the record described by `wc`.
pub fn check(file: &File, wc: &WriteControl, no_footer: bool) -> Result<()> {
    if no_footer || wc.flags.contains(DcFlags::NOCSUM) {
        return Ok(());
    }
    if wc.total_size < wc.total_data_size {
        return Err(Error::InvalidArgument(format!(
            "record total_size {} below total_data_size {}",
            wc.total_size, wc.total_data_size
        )));
    }

    if wc.flags.contains(DcFlags::CHUNKED_CSUM) {
        verify_chunked(file, wc, 0, wc.total_data_size)
    } else {
        verify_legacy(file, wc)
    }
}
