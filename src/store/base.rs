//! A single base: one data file plus its index file.
//!
//! The data file is an append-only stream of framed records; the
//! index file mirrors every record's 96-byte disk-control header in
//! write order. Once sorted, the index is replaced by the
//! `.index.sorted` sidecar (same headers, key order) plus a bloom
//! filter, and the base is looked up through binary search instead of
//! the RAM hash index.
//!
//! All mutation of a base serializes on its state mutex; reads are
//! positional and lock free.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};

use crate::store::bloom::Bloom;
use crate::store::config::BlobConfig;
use crate::store::disk_control::{
    aligned_disk_size, DcFlags, DiskControl, Key, WriteControl, DISK_CONTROL_SIZE,
};
use crate::store::error::{Error, Result};
use crate::store::footer;
use crate::tools::file::{copy_range, file_size, fsync, read_all_at, write_all_at};

const DC_SIZE: u64 = DISK_CONTROL_SIZE as u64;

pub(crate) fn data_path(prefix: &Path, num: u64) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(format!(".{}", num));
    PathBuf::from(os)
}

pub(crate) fn index_path(prefix: &Path, num: u64) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(format!(".{}.index", num));
    PathBuf::from(os)
}

pub(crate) fn sorted_index_path(prefix: &Path, num: u64) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(format!(".{}.index.sorted", num));
    PathBuf::from(os)
}

pub(crate) fn bloom_path(prefix: &Path, num: u64) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(format!(".{}.index.sorted.bloom", num));
    PathBuf::from(os)
}

/// Mutable bookkeeping of one base, behind the base mutex.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BaseState {
    /// Offset the next appended record starts at.
    pub append_offset: u64,
    /// Bytes used in the index file.
    pub index_size: u64,
    pub records: u64,
    pub removed: u64,
    pub removed_size: u64,
    pub corrupted: u64,
    pub corrupted_size: u64,
}

struct BlockEntry {
    first_key: Key,
    index_offset: u64,
}

pub struct Base {
    num: u64,
    data_path: PathBuf,
    index_file_path: PathBuf,
    data: File,
    index: File,
    sorted: bool,
    state: Mutex<BaseState>,
    /// Raised while datasort consumes this base; write paths then
    /// refuse in-place updates so the sort never publishes stale
    /// payload bytes.
    pub(crate) sorting: AtomicBool,
    block_index: Vec<BlockEntry>,
    bloom: Option<Bloom>,
    index_block_size: u64,
}

impl Base {
    /// Create a fresh, empty, writable base.
    pub(crate) fn create(prefix: &Path, num: u64, cfg: &BlobConfig) -> Result<Self> {
        let data_path = data_path(prefix, num);
        let index_file_path = index_path(prefix, num);
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index_file_path)?;
        log::info!("blob: {}: created base {}", cfg.stat_id, num);
        Ok(Self {
            num,
            data_path,
            index_file_path,
            data,
            index,
            sorted: false,
            state: Mutex::new(BaseState::default()),
            sorting: AtomicBool::new(false),
            block_index: Vec::new(),
            bloom: None,
            index_block_size: cfg.index_block_size.max(1) as u64,
        })
    }

    /// Open an existing base, detecting the sorted sidecar.
    ///
    /// Scans the index once to rebuild the record counters (including
    /// the persisted corruption accounting) and, for sorted bases,
    /// the block index and bloom filter.
    pub(crate) fn open(prefix: &Path, num: u64, cfg: &BlobConfig) -> Result<Self> {
        let data_path = data_path(prefix, num);
        let sorted_path = sorted_index_path(prefix, num);
        let (index_file_path, sorted) = if sorted_path.exists() {
            (sorted_path, true)
        } else {
            (index_path(prefix, num), false)
        };

        let data = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&index_file_path)?;

        let mut base = Self {
            num,
            data_path,
            index_file_path,
            data,
            index,
            sorted,
            state: Mutex::new(BaseState::default()),
            sorting: AtomicBool::new(false),
            block_index: Vec::new(),
            bloom: None,
            index_block_size: cfg.index_block_size.max(1) as u64,
        };
        base.scan(prefix, cfg)?;
        Ok(base)
    }

    fn scan(&mut self, prefix: &Path, cfg: &BlobConfig) -> Result<()> {
        let index_size = file_size(&self.index)?;
        if index_size % DC_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "index file {:?} has truncated entry (size {})",
                self.index_file_path, index_size
            )));
        }

        let bloom_file = bloom_path(prefix, self.num);
        let mut rebuild_bloom = None;
        if self.sorted {
            if bloom_file.exists() {
                self.bloom = Some(Bloom::from_file(&bloom_file)?);
            } else {
                rebuild_bloom = Some(Bloom::new(cfg.index_block_bloom_length));
            }
        }

        let mut state = BaseState::default();
        state.index_size = index_size;
        state.records = index_size / DC_SIZE;

        for slot in 0..state.records {
            let offset = slot * DC_SIZE;
            let dc = self.read_index_dc(offset)?;
            let end = dc.offset + dc.disk_size;
            if end > state.append_offset {
                state.append_offset = end;
            }
            if dc.is_removed() {
                state.removed += 1;
                state.removed_size += dc.disk_size;
            } else {
                if dc.is_corrupted() {
                    state.corrupted += 1;
                    state.corrupted_size += dc.data_size;
                }
                if let Some(ref mut bloom) = rebuild_bloom {
                    bloom.insert(&dc.key);
                }
            }
            if self.sorted && slot % self.index_block_size == 0 {
                self.block_index.push(BlockEntry {
                    first_key: dc.key,
                    index_offset: offset,
                });
            }
        }

        if let Some(bloom) = rebuild_bloom {
            bloom.save(&bloom_file)?;
            self.bloom = Some(bloom);
        }

        log::info!(
            "blob: {}: opened base {}: records: {}, removed: {}, corrupted: {}, sorted: {}",
            cfg.stat_id,
            self.num,
            state.records,
            state.removed,
            state.corrupted,
            self.sorted
        );
        *self.state.get_mut().unwrap() = state;
        Ok(())
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub(crate) fn data_file(&self) -> &File {
        &self.data
    }

    pub(crate) fn state(&self) -> BaseState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<BaseState> {
        self.state.lock().unwrap()
    }

    /// Size of the used part of the data file.
    pub fn data_size(&self) -> u64 {
        self.state.lock().unwrap().append_offset
    }

    pub(crate) fn read_index_raw(&self, index_offset: u64) -> Result<[u8; DISK_CONTROL_SIZE]> {
        let mut buf = [0u8; DISK_CONTROL_SIZE];
        read_all_at(&self.index, &mut buf, index_offset)?;
        Ok(buf)
    }

    pub(crate) fn read_data_raw(&self, ctl_data_offset: u64) -> Result<[u8; DISK_CONTROL_SIZE]> {
        let mut buf = [0u8; DISK_CONTROL_SIZE];
        read_all_at(&self.data, &mut buf, ctl_data_offset)?;
        Ok(buf)
    }

    pub(crate) fn read_index_dc(&self, index_offset: u64) -> Result<DiskControl> {
        DiskControl::from_bytes(&self.read_index_raw(index_offset)?)
    }

    /// Read `size` payload bytes of `dc` starting at `offset`.
    pub(crate) fn read_payload(&self, dc: &DiskControl, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset + size > dc.data_size {
            return Err(Error::InvalidArgument(format!(
                "read beyond record: offset {} size {} data_size {}",
                offset, size, dc.data_size
            )));
        }
        let mut buf = vec![0u8; size as usize];
        read_all_at(&self.data, &mut buf, dc.data_offset() + offset)?;
        Ok(buf)
    }

    /// Append a new record.
    ///
    /// With `prefill` the payload of a prior record copy is carried
    /// forward around the freshly written range, so a partial write
    /// that outgrows its old copy still produces a complete record.
    pub(crate) fn append(
        &self,
        key: Key,
        payload: &[u8],
        payload_offset: u64,
        user_flags: DcFlags,
        prefill: Option<(&Base, DiskControl)>,
        cfg: &BlobConfig,
        alignment: u64,
    ) -> Result<WriteControl> {
        let mut state = self.state.lock().unwrap();

        let old_size = prefill.as_ref().map(|(_, dc)| dc.data_size).unwrap_or(0);
        let write_end = payload_offset + payload.len() as u64;
        let total_data_size = write_end.max(old_size);

        let no_footer = !cfg.footers_enabled();
        let nocsum = user_flags.contains(DcFlags::NOCSUM);
        let mut flags = user_flags.sanitize_user();
        if !no_footer && !nocsum {
            flags |= DcFlags::CHUNKED_CSUM;
        }

        let footer_bytes = footer::footer_size(no_footer, total_data_size);
        let disk_size = aligned_disk_size(total_data_size, footer_bytes, alignment);

        let ctl_data_offset = state.append_offset;
        let ctl_index_offset = state.index_size;
        let dc = DiskControl {
            key,
            flags,
            data_size: total_data_size,
            disk_size,
            offset: ctl_data_offset,
        };

        write_all_at(&self.data, &dc.to_bytes(), ctl_data_offset)?;

        if let Some((src, old_dc)) = prefill {
            let keep_head = old_size.min(payload_offset);
            if keep_head > 0 {
                copy_range(
                    src.data_file(),
                    old_dc.data_offset(),
                    &self.data,
                    ctl_data_offset + DC_SIZE,
                    keep_head,
                )?;
            }
            if old_size > write_end {
                copy_range(
                    src.data_file(),
                    old_dc.data_offset() + write_end,
                    &self.data,
                    ctl_data_offset + DC_SIZE + write_end,
                    old_size - write_end,
                )?;
            }
        }
        if !payload.is_empty() {
            write_all_at(&self.data, payload, ctl_data_offset + DC_SIZE + payload_offset)?;
        }

        let wc = WriteControl {
            base_index: self.num,
            flags,
            size: payload.len() as u64,
            offset: payload_offset,
            total_data_size,
            total_size: disk_size,
            ctl_data_offset,
            ctl_index_offset,
            data_offset: ctl_data_offset + DC_SIZE,
        };
        footer::commit(&self.data, &wc, no_footer)?;

        // the index entry goes in last; a crash before this point
        // leaves an unreferenced hole in the data file
        write_all_at(&self.index, &dc.to_bytes(), ctl_index_offset)?;

        state.append_offset += disk_size;
        state.index_size += DC_SIZE;
        state.records += 1;
        drop(state);

        if cfg.sync == 0 {
            fsync(&self.data)?;
            fsync(&self.index)?;
        }

        log::debug!(
            "blob: {}: {}: written: base: {}, ctl_data_offset: {}, disk_size: {}",
            cfg.stat_id,
            key.dump(),
            self.num,
            ctl_data_offset,
            disk_size
        );
        Ok(wc)
    }

    /// Overwrite payload bytes of an existing record in place and
    /// refresh the footers of the touched chunks.
    pub(crate) fn overwrite(
        &self,
        dc: &DiskControl,
        ctl_index_offset: u64,
        payload: &[u8],
        payload_offset: u64,
        cfg: &BlobConfig,
    ) -> Result<WriteControl> {
        let state = self.state.lock().unwrap();

        write_all_at(&self.data, payload, dc.data_offset() + payload_offset)?;

        let wc = WriteControl {
            base_index: self.num,
            flags: dc.flags,
            size: payload.len() as u64,
            offset: payload_offset,
            total_data_size: dc.data_size,
            total_size: dc.disk_size,
            ctl_data_offset: dc.offset,
            ctl_index_offset,
            data_offset: dc.data_offset(),
        };
        footer::commit_range(
            &self.data,
            &wc,
            payload_offset,
            payload.len() as u64,
            !cfg.footers_enabled(),
        )?;
        drop(state);

        if cfg.sync == 0 {
            fsync(&self.data)?;
        }
        Ok(wc)
    }

    /// Rewrite both header copies of one record.
    fn write_both_headers(&self, index_offset: u64, dc: &DiskControl) -> Result<()> {
        let bytes = dc.to_bytes();
        write_all_at(&self.index, &bytes, index_offset)?;
        write_all_at(&self.data, &bytes, dc.offset)?;
        Ok(())
    }

    /// Flip the `REMOVED` bit in both header copies.
    ///
    /// Returns the prior header so the caller can settle the global
    /// corruption accounting. Fails `NotFound` when the record is
    /// already dead.
    pub(crate) fn mark_removed(&self, index_offset: u64) -> Result<DiskControl> {
        let mut state = self.state.lock().unwrap();
        let old = self.read_index_dc(index_offset)?;
        if old.is_removed() {
            return Err(Error::NotFound);
        }
        let mut new = old;
        new.flags |= DcFlags::REMOVED;
        self.write_both_headers(index_offset, &new)?;
        state.removed += 1;
        state.removed_size += old.disk_size;
        if old.is_corrupted() {
            state.corrupted -= 1;
            state.corrupted_size -= old.data_size;
        }
        Ok(old)
    }

    /// Persist the `CORRUPTED` bit; `Some(dc)` when it was newly set.
    pub(crate) fn mark_corrupted(&self, index_offset: u64) -> Result<Option<DiskControl>> {
        let mut state = self.state.lock().unwrap();
        let old = self.read_index_dc(index_offset)?;
        if old.is_corrupted() || old.is_removed() {
            return Ok(None);
        }
        let mut new = old;
        new.flags |= DcFlags::CORRUPTED;
        self.write_both_headers(index_offset, &new)?;
        state.corrupted += 1;
        state.corrupted_size += new.data_size;
        Ok(Some(new))
    }

    /// Drop the `CORRUPTED` bit; `Some(dc)` when it was set before.
    pub(crate) fn clear_corrupted(&self, index_offset: u64) -> Result<Option<DiskControl>> {
        let mut state = self.state.lock().unwrap();
        let old = self.read_index_dc(index_offset)?;
        if !old.is_corrupted() || old.is_removed() {
            return Ok(None);
        }
        let mut new = old;
        new.flags &= !DcFlags::CORRUPTED;
        self.write_both_headers(index_offset, &new)?;
        state.corrupted -= 1;
        state.corrupted_size -= old.data_size;
        Ok(Some(new))
    }

    /// Walk the index sequentially, calling `f(dc, index_offset)` for
    /// every record. Returning `false` from `f` stops the walk.
    ///
    /// Deliberately does not touch the state mutex: callers may hold
    /// it to keep writers out for the duration of the walk.
    pub(crate) fn for_each_record<F>(&self, skip_removed: bool, mut f: F) -> Result<()>
    where
        F: FnMut(DiskControl, u64) -> Result<bool>,
    {
        const BATCH: u64 = 128;

        let records = file_size(&self.index)? / DC_SIZE;
        let mut buf = vec![0u8; (BATCH * DC_SIZE) as usize];
        let mut slot = 0u64;
        while slot < records {
            let step = BATCH.min(records - slot);
            let bytes = (step * DC_SIZE) as usize;
            read_all_at(&self.index, &mut buf[..bytes], slot * DC_SIZE)?;
            for i in 0..step {
                let start = (i * DC_SIZE) as usize;
                let dc = DiskControl::from_bytes(&buf[start..start + DISK_CONTROL_SIZE])?;
                if skip_removed && dc.is_removed() {
                    continue;
                }
                if !f(dc, (slot + i) * DC_SIZE)? {
                    return Ok(());
                }
            }
            slot += step;
        }
        Ok(())
    }

    /// Binary search a sorted base for `key`.
    ///
    /// The bloom filter rejects most absent keys without touching the
    /// index; otherwise the block index narrows the search to one
    /// block which is scanned with a binary search.
    pub(crate) fn lookup_sorted(&self, key: &Key) -> Result<Option<(DiskControl, u64)>> {
        if !self.sorted {
            return Ok(None);
        }
        if let Some(ref bloom) = self.bloom {
            if !bloom.contains(key) {
                return Ok(None);
            }
        }

        // last block whose first key is <= key
        let block = match self
            .block_index
            .binary_search_by(|entry| entry.first_key.cmp(key))
        {
            Ok(pos) => pos,
            Err(0) => return Ok(None),
            Err(pos) => pos - 1,
        };

        let records = self.state.lock().unwrap().records;
        let first_slot = self.block_index[block].index_offset / DC_SIZE;
        let last_slot = (first_slot + self.index_block_size).min(records);

        let mut lo = first_slot;
        let mut hi = last_slot;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let dc = self.read_index_dc(mid * DC_SIZE)?;
            match dc.key.cmp(key) {
                std::cmp::Ordering::Equal => {
                    // dead copies of a rewritten key sit next to the
                    // live one; scan the whole equal run, which may
                    // cross block boundaries
                    let mut slot = mid;
                    while slot > 0 {
                        let prev = self.read_index_dc((slot - 1) * DC_SIZE)?;
                        if prev.key != *key {
                            break;
                        }
                        slot -= 1;
                    }
                    while slot < records {
                        let dc = self.read_index_dc(slot * DC_SIZE)?;
                        if dc.key != *key {
                            break;
                        }
                        if !dc.is_removed() {
                            return Ok(Some((dc, slot * DC_SIZE)));
                        }
                        slot += 1;
                    }
                    return Ok(None);
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Fraction of this base occupied by removed records, in percent.
    pub(crate) fn dead_percentage(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.records == 0 {
            return 0;
        }
        state.removed * 100 / state.records
    }

    pub(crate) fn fsync_all(&self) -> Result<()> {
        fsync(&self.data)?;
        fsync(&self.index)?;
        Ok(())
    }

    /// Unlink every file belonging to this base.
    pub(crate) fn unlink_files(&self, prefix: &Path) -> Result<()> {
        let _ = std::fs::remove_file(&self.data_path);
        let _ = std::fs::remove_file(index_path(prefix, self.num));
        let _ = std::fs::remove_file(sorted_index_path(prefix, self.num));
        let _ = std::fs::remove_file(bloom_path(prefix, self.num));
        Ok(())
    }
}
