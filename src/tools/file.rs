//! Positional file I/O helpers.
//!
//! All record I/O goes through `pread`/`pwrite` so that concurrent
//! readers never depend on a shared file cursor. Short transfers are
//! retried until the full count is done, mirroring the usual
//! read-loop discipline for regular files.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sys::uio::{pread, pwrite};

/// Map a nix error onto `std::io::Error`, preserving the errno.
pub fn nix_to_io(err: nix::Error) -> io::Error {
    match err.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, err.to_string()),
    }
}

/// Read exactly `buf.len()` bytes at `offset`.
pub fn read_all_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let count = pread(fd, &mut buf[done..], (offset + done as u64) as libc::off_t)
            .map_err(nix_to_io)?;
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read at offset {}", offset + done as u64),
            ));
        }
        done += count;
    }
    Ok(())
}

/// Write all of `buf` at `offset`.
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let count = pwrite(fd, &buf[done..], (offset + done as u64) as libc::off_t)
            .map_err(nix_to_io)?;
        if count == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite returned 0"));
        }
        done += count;
    }
    Ok(())
}

/// Copy `len` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
pub fn copy_range(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    len: u64,
) -> io::Result<()> {
    const COPY_BUFFER_SIZE: u64 = 1024 * 1024;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(len.max(1)) as usize];
    let mut done = 0u64;
    while done < len {
        let step = COPY_BUFFER_SIZE.min(len - done) as usize;
        read_all_at(src, &mut buf[..step], src_offset + done)?;
        write_all_at(dst, &buf[..step], dst_offset + done)?;
        done += step as u64;
    }
    Ok(())
}

/// Current length of an open file.
pub fn file_size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Flush file data and metadata to stable storage.
pub fn fsync(file: &File) -> io::Result<()> {
    nix::unistd::fsync(file.as_raw_fd()).map_err(nix_to_io)
}

/// Preferred record alignment for files below `path`.
///
/// The smaller of the filesystem block size and 4096; 4096 when the
/// filesystem cannot be queried.
pub fn io_alignment<P: AsRef<Path>>(path: P) -> u64 {
    const MAX_ALIGNMENT: u64 = 4096;

    match nix::sys::statvfs::statvfs(path.as_ref()) {
        Ok(stat) => {
            let bsize = stat.block_size() as u64;
            if bsize == 0 {
                MAX_ALIGNMENT
            } else {
                bsize.min(MAX_ALIGNMENT)
            }
        }
        Err(_) => MAX_ALIGNMENT,
    }
}
