//! The backend: ordered base list, request routing and the public
//! embedder API.
//!
//! One backend owns a directory of bases. Requests read-lock the base
//! list, resolve the key through the RAM hash index (unsorted bases)
//! or the sorted sidecars (sorted bases), and do their I/O under the
//! owning base's mutex. The list itself is only write-locked for base
//! rotation and the datasort commit swap.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use nix::fcntl::{flock, FlockArg};

use crate::store::base::{self, Base};
use crate::store::bloom::Bloom;
use crate::store::config::{BlobConfig, BlobFlags};
use crate::store::datasort::{self, DatasortJob};
use crate::store::disk_control::{DcFlags, DiskControl, Key, WriteControl, DISK_CONTROL_SIZE};
use crate::store::error::{Error, Result};
use crate::store::footer;
use crate::store::index::{HashIndex, RamControl};
use crate::store::periodic;
use crate::store::stats::{StatRegister, Stats, StatsSnapshot};
use crate::store::{DefragState, InspectState, ReadMode};
use crate::tools::file::{fsync, io_alignment, write_all_at};

bitflags::bitflags! {
    /// Iteration behaviour switches.
    pub struct IterateFlags: u32 {
        /// Visit every base; without this only unsorted bases are
        /// walked.
        const ALL = 0x01;
        /// Take shared locks only, allowing concurrent writers.
        const READONLY = 0x02;
    }
}

/// Parameters of an [`Backend::iterate`] run.
#[derive(Clone, Copy, Debug)]
pub struct IterateControl {
    pub flags: IterateFlags,
}

impl Default for IterateControl {
    fn default() -> Self {
        Self {
            flags: IterateFlags::ALL | IterateFlags::READONLY,
        }
    }
}

/// Scoped payload access handed to iteration callbacks.
///
/// Borrows the owning base, so it cannot outlive the iteration.
pub struct RecordReader<'a> {
    base: &'a Base,
    dc: DiskControl,
}

impl RecordReader<'_> {
    /// Read `size` payload bytes starting at `offset`.
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.base.read_payload(&self.dc, offset, size)
    }

    /// Read the whole payload.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.base.read_payload(&self.dc, 0, self.dc.data_size)
    }

    /// Absolute payload offset within the base's data file.
    pub fn data_offset(&self) -> u64 {
        self.dc.data_offset()
    }
}

pub(crate) struct Shared {
    pub(crate) cfg: BlobConfig,
    pub(crate) alignment: u64,
    pub(crate) bases: RwLock<Vec<Arc<Base>>>,
    pub(crate) hash_index: HashIndex,
    pub(crate) stats: Stats,
    pub(crate) defrag_chunks_dir: Mutex<Option<PathBuf>>,
    pub(crate) want_defrag: AtomicI32,
    pub(crate) want_inspect: AtomicI32,
    pub(crate) shutdown: AtomicBool,
    wake: Mutex<Option<Sender<()>>>,
    _guard: File,
}

/// An embedded blob store instance.
pub struct Backend {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Backend {
    /// Open (or create) the store below `cfg.file` and rebuild the
    /// in-RAM state from the on-disk bases.
    pub fn init(cfg: BlobConfig) -> Result<Backend> {
        if cfg.file.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("config.file must be set".into()));
        }
        let dir = cfg.base_dir();
        std::fs::create_dir_all(&dir)?;

        let guard = lock_backend_dir(&cfg.file)?;
        let alignment = io_alignment(&dir);
        let hash_index = HashIndex::new(cfg.blob_flags.contains(BlobFlags::L2HASH));

        let mut bases: Vec<Arc<Base>> = Vec::new();
        for num in scan_base_numbers(&cfg)? {
            bases.push(Arc::new(Base::open(&cfg.file, num, &cfg)?));
        }
        // a sorted base can never take appends, so make sure the list
        // always ends in a writable one
        let create_num = match bases.last() {
            None => Some(0),
            Some(last) if last.is_sorted() => Some(last.num() + 1),
            Some(_) => None,
        };
        if let Some(num) = create_num {
            bases.push(Arc::new(Base::create(&cfg.file, num, &cfg)?));
        }

        // oldest first, so a newer live copy of a key wins the slot
        for b in &bases {
            if b.is_sorted() {
                continue;
            }
            b.for_each_record(true, |dc, index_offset| {
                hash_index.insert(
                    dc.key,
                    RamControl {
                        base_num: b.num(),
                        index_offset,
                    },
                );
                Ok(true)
            })?;
        }

        log::info!(
            "blob: {}: backend opened: {} base(s), {} keys in RAM index",
            cfg.stat_id,
            bases.len(),
            hash_index.len()
        );

        let threads = cfg.threads_enabled();
        let shared = Arc::new(Shared {
            cfg,
            alignment,
            bases: RwLock::new(bases),
            hash_index,
            stats: Stats::new(),
            defrag_chunks_dir: Mutex::new(None),
            want_defrag: AtomicI32::new(DefragState::NotStarted.as_raw()),
            want_inspect: AtomicI32::new(InspectState::NotStarted.as_raw()),
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(None),
            _guard: guard,
        });

        let worker = if threads {
            let (tx, rx) = crossbeam_channel::unbounded();
            *shared.wake.lock().unwrap() = Some(tx);
            Some(periodic::spawn(shared.clone(), rx))
        } else {
            None
        };

        Ok(Backend { shared, worker })
    }

    /// Shut the backend down, joining the background worker.
    ///
    /// Dropping the backend does the same; this exists for symmetry
    /// with `init`.
    pub fn cleanup(self) {}

    /// Store `data` under `key` at payload offset `offset`.
    pub fn write(&self, key: &Key, data: &[u8], offset: u64, flags: DcFlags) -> Result<WriteControl> {
        self.shared.write(key, data, offset, flags)
    }

    /// `write` with the key derived by hashing arbitrary bytes.
    pub fn write_hashed(
        &self,
        raw_key: &[u8],
        data: &[u8],
        offset: u64,
        flags: DcFlags,
    ) -> Result<WriteControl> {
        self.shared.write(&Key::hashed(raw_key), data, offset, flags)
    }

    /// Read the full payload of `key`.
    pub fn read(&self, key: &Key, mode: ReadMode) -> Result<Vec<u8>> {
        self.shared.read(key, mode)
    }

    /// Mark the record of `key` removed in both header copies.
    pub fn remove(&self, key: &Key) -> Result<()> {
        self.shared.remove(key)
    }

    /// `remove` with the key derived by hashing arbitrary bytes.
    pub fn remove_hashed(&self, raw_key: &[u8]) -> Result<()> {
        self.shared.remove(&Key::hashed(raw_key))
    }

    /// Resolve `key` to its on-disk placement.
    pub fn lookup(&self, key: &Key) -> Result<WriteControl> {
        let bases = self.shared.bases.read().unwrap();
        let (b, dc, index_offset) = self
            .shared
            .locate(&bases, key)?
            .ok_or(Error::NotFound)?;
        Ok(WriteControl::from_dc(&dc, b.num(), index_offset))
    }

    /// Verify the record checksums of `key`.
    ///
    /// A mismatch persists the `CORRUPTED` bit exactly once per
    /// record. Unlike [`read`](Self::read) this never compares the
    /// two header copies, it trusts the index.
    pub fn verify_checksum(&self, key: &Key) -> Result<()> {
        let shared = &self.shared;
        let bases = shared.bases.read().unwrap();
        let (b, dc, index_offset) = shared.locate(&bases, key)?.ok_or(Error::NotFound)?;
        shared.verify_record(&b, &dc, index_offset)
    }

    /// Walk live records of the selected bases in deterministic
    /// order: index order for unsorted bases, key order for sorted
    /// ones.
    pub fn iterate<F>(&self, ctl: IterateControl, mut f: F) -> Result<()>
    where
        F: FnMut(&DiskControl, &RecordReader) -> Result<()>,
    {
        let bases = self.shared.bases.read().unwrap();
        for b in bases.iter() {
            if b.is_sorted() && !ctl.flags.contains(IterateFlags::ALL) {
                continue;
            }
            let _exclusive = if ctl.flags.contains(IterateFlags::READONLY) {
                None
            } else {
                Some(b.lock_state())
            };
            b.for_each_record(true, |dc, _| {
                let reader = RecordReader {
                    base: b.as_ref(),
                    dc,
                };
                f(&dc, &reader)?;
                Ok(true)
            })?;
        }
        Ok(())
    }

    /// Run a checksum inspection over every base.
    ///
    /// Runs inline when background threads are disabled, otherwise
    /// the background worker picks it up.
    pub fn inspect(&self) -> Result<()> {
        self.shared
            .want_inspect
            .store(InspectState::Inspecting.as_raw(), Ordering::SeqCst);
        if self.worker.is_some() {
            self.shared.wake();
            return Ok(());
        }
        let result = periodic::run_inspection(&self.shared);
        self.shared
            .want_inspect
            .store(InspectState::NotStarted.as_raw(), Ordering::SeqCst);
        result
    }

    pub fn inspect_status(&self) -> InspectState {
        InspectState::from_raw(self.shared.want_inspect.load(Ordering::SeqCst))
    }

    /// Defragment every base whose dead fraction crossed
    /// `defrag_percentage` (plus, for sort mode, any unsorted
    /// read-only base).
    pub fn defrag(&self) -> Result<()> {
        if self.worker.is_some() {
            self.shared
                .want_defrag
                .store(DefragState::DataSort.as_raw(), Ordering::SeqCst);
            self.shared.wake();
            return Ok(());
        }
        self.shared.run_defrag(DefragState::DataSort, false)
    }

    /// Request a background defrag with `dir` as the scratch chunks
    /// directory for that run.
    pub fn start_defrag_in_dir(&self, mode: DefragState, dir: Option<&Path>) -> Result<()> {
        if mode == DefragState::NotStarted {
            return Err(Error::InvalidArgument(
                "defrag mode must be DataSort or DataCompact".into(),
            ));
        }
        *self.shared.defrag_chunks_dir.lock().unwrap() = dir.map(|p| p.to_owned());
        self.shared.want_defrag.store(mode.as_raw(), Ordering::SeqCst);
        self.shared.wake();
        Ok(())
    }

    /// Cancel a pending or running defrag and clear the scratch
    /// directory override.
    pub fn stop_defrag(&self) -> Result<()> {
        self.shared
            .want_defrag
            .store(DefragState::NotStarted.as_raw(), Ordering::SeqCst);
        *self.shared.defrag_chunks_dir.lock().unwrap() = None;
        self.shared.wake();
        Ok(())
    }

    pub fn defrag_status(&self) -> DefragState {
        DefragState::from_raw(self.shared.want_defrag.load(Ordering::SeqCst))
    }

    /// Merge-sort an explicit set of bases (by position in the base
    /// list) into one sorted output base.
    pub fn datasort(&self, positions: &[usize]) -> Result<()> {
        self.shared
            .datasort_positions(positions, DefragState::DataSort)
    }

    /// Compact an explicit set of bases without sorting.
    pub fn datacompact(&self, positions: &[usize]) -> Result<()> {
        self.shared
            .datasort_positions(positions, DefragState::DataCompact)
    }

    /// Read one statistics register.
    pub fn stat_get(&self, reg: StatRegister) -> i64 {
        self.shared.stat_get(reg)
    }

    /// Consistent copy of all registers.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_total: self.stat_get(StatRegister::RecordsTotal),
            records_removed: self.stat_get(StatRegister::RecordsRemoved),
            removed_size: self.stat_get(StatRegister::RemovedSize),
            records_corrupted: self.stat_get(StatRegister::RecordsCorrupted),
            corrupted_size: self.stat_get(StatRegister::CorruptedSize),
            datasort_completion_status: self.stat_get(StatRegister::DatasortCompletionStatus),
            datasort_view_used: self.stat_get(StatRegister::DatasortViewUsed),
            datasort_sorted_view_used: self.stat_get(StatRegister::DatasortSortedViewUsed),
            datasort_single_pass_view_used: self
                .stat_get(StatRegister::DatasortSinglePassViewUsed),
        }
    }

    /// Number of bases currently in the list.
    pub fn base_count(&self) -> usize {
        self.shared.bases.read().unwrap().len()
    }

    /// Per-base counters, oldest base first.
    pub fn base_info(&self) -> Vec<BaseInfo> {
        let bases = self.shared.bases.read().unwrap();
        bases
            .iter()
            .map(|b| {
                let state = b.state();
                BaseInfo {
                    num: b.num(),
                    sorted: b.is_sorted(),
                    records: state.records,
                    removed: state.removed,
                    removed_size: state.removed_size,
                    corrupted: state.corrupted,
                    data_size: state.append_offset,
                }
            })
            .collect()
    }
}

/// Point-in-time counters of one base.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct BaseInfo {
    pub num: u64,
    pub sorted: bool,
    pub records: u64,
    pub removed: u64,
    pub removed_size: u64,
    pub corrupted: u64,
    pub data_size: u64,
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if self.shared.cfg.sync >= 0 {
            let bases = self.shared.bases.read().unwrap();
            for b in bases.iter() {
                if let Err(err) = b.fsync_all() {
                    log::warn!(
                        "blob: {}: fsync of base {} on close failed: {}",
                        self.shared.cfg.stat_id,
                        b.num(),
                        err
                    );
                }
            }
        }
    }
}

impl Shared {
    pub(crate) fn wake(&self) {
        if let Some(tx) = self.wake.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Find the live record of `key`: RAM hash index first, then the
    /// sorted bases, newest to oldest.
    pub(crate) fn locate(
        &self,
        bases: &[Arc<Base>],
        key: &Key,
    ) -> Result<Option<(Arc<Base>, DiskControl, u64)>> {
        if let Some(rctl) = self.hash_index.get(key) {
            if let Some(b) = bases.iter().find(|b| b.num() == rctl.base_num) {
                let dc = b.read_index_dc(rctl.index_offset)?;
                if !dc.is_removed() {
                    return Ok(Some((b.clone(), dc, rctl.index_offset)));
                }
            }
        }
        for b in bases.iter().rev() {
            if !b.is_sorted() {
                continue;
            }
            if let Some((dc, index_offset)) = b.lookup_sorted(key)? {
                return Ok(Some((b.clone(), dc, index_offset)));
            }
        }
        Ok(None)
    }

    fn base_full(&self, b: &Base) -> bool {
        if b.is_sorted() {
            return true;
        }
        let state = b.state();
        state.records >= self.cfg.records_in_blob || state.append_offset >= self.cfg.blob_size
    }

    /// Push a fresh base onto the list once the active one is full.
    fn rotate(&self) -> Result<()> {
        let mut bases = self.bases.write().unwrap();
        let active = bases.last().expect("base list is never empty").clone();
        if !self.base_full(&active) {
            // someone else rotated while we waited for the lock
            return Ok(());
        }
        let new_base = Base::create(&self.cfg.file, active.num() + 1, &self.cfg)?;
        bases.push(Arc::new(new_base));
        if self.cfg.blob_flags.contains(BlobFlags::AUTO_INDEXSORT) && !active.is_sorted() {
            self.indexsort(&mut bases, &active)?;
        }
        Ok(())
    }

    /// Sort a retired base's index into the `.sorted` sidecar.
    ///
    /// The data file stays as written; only lookups change shape. The
    /// hash index drops the base since the sidecar takes over.
    fn indexsort(&self, bases: &mut Vec<Arc<Base>>, retiring: &Arc<Base>) -> Result<()> {
        let prefix = &self.cfg.file;
        let mut entries: Vec<DiskControl> = Vec::new();
        retiring.for_each_record(false, |dc, _| {
            entries.push(dc);
            Ok(true)
        })?;
        // dead copies sort after live ones of the same key
        entries.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.is_removed().cmp(&b.is_removed()))
        });

        let tmp = {
            let mut os = prefix.as_os_str().to_owned();
            os.push(format!(".{}.indexsort.tmp", retiring.num()));
            PathBuf::from(os)
        };
        {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut bloom = Bloom::new(self.cfg.index_block_bloom_length);
            let mut offset = 0u64;
            for dc in &entries {
                write_all_at(&file, &dc.to_bytes(), offset)?;
                if !dc.is_removed() {
                    bloom.insert(&dc.key);
                }
                offset += DISK_CONTROL_SIZE as u64;
            }
            if self.cfg.sync >= 0 {
                fsync(&file)?;
            }
            bloom.save(&base::bloom_path(prefix, retiring.num()))?;
        }
        std::fs::rename(&tmp, &base::sorted_index_path(prefix, retiring.num()))?;
        let _ = std::fs::remove_file(base::index_path(prefix, retiring.num()));

        let reopened = Arc::new(Base::open(prefix, retiring.num(), &self.cfg)?);
        if let Some(pos) = bases.iter().position(|b| Arc::ptr_eq(b, retiring)) {
            bases[pos] = reopened;
        }
        self.hash_index.remove_base(retiring.num());
        log::info!(
            "blob: {}: base {}: index sorted on rotation",
            self.cfg.stat_id,
            retiring.num()
        );
        Ok(())
    }

    fn write(&self, key: &Key, data: &[u8], offset: u64, flags: DcFlags) -> Result<WriteControl> {
        loop {
            // held across the whole write so a datasort commit can
            // never swap the bases out from under a half-done update
            let bases = self.bases.read().unwrap();

            if self.cfg.blob_size_limit > 0 {
                let used: u64 = bases.iter().map(|b| b.data_size()).sum();
                if used + data.len() as u64 > self.cfg.blob_size_limit {
                    return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)));
                }
            }

            let existing = self.locate(&bases, key)?;

            // overwrite in place when the new bytes fit the committed
            // payload and the base is not being consumed by datasort
            if let Some((ref b, dc, index_offset)) = existing {
                let fits = offset + data.len() as u64 <= dc.data_size;
                let rewritable =
                    dc.has_chunked_csum() || dc.is_nocsum() || !self.cfg.footers_enabled();
                if fits && rewritable && !b.sorting.load(Ordering::SeqCst) {
                    let dc = match b.clear_corrupted(index_offset)? {
                        Some(updated) => updated,
                        None => dc,
                    };
                    return b.overwrite(&dc, index_offset, data, offset, &self.cfg);
                }
            }

            let active = bases.last().expect("base list is never empty").clone();
            if self.base_full(&active) {
                drop(bases);
                self.rotate()?;
                continue;
            }

            let prefill = existing.as_ref().map(|(b, dc, _)| (b.as_ref(), *dc));
            let wc = active.append(
                *key,
                data,
                offset,
                flags,
                prefill,
                &self.cfg,
                self.alignment,
            )?;

            self.hash_index.insert(
                *key,
                RamControl {
                    base_num: active.num(),
                    index_offset: wc.ctl_index_offset,
                },
            );

            // the old copy dies only after the new one is fully
            // committed, footers included
            if let Some((b, _, index_offset)) = existing {
                match b.mark_removed(index_offset) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(wc);
        }
    }

    fn read(&self, key: &Key, mode: ReadMode) -> Result<Vec<u8>> {
        let bases = self.bases.read().unwrap();
        let (b, dc, index_offset) = self.locate(&bases, key)?.ok_or(Error::NotFound)?;

        // the header copy in the data file must match the index copy
        // byte for byte; a mismatch is reported as-is and is *not*
        // recorded as data corruption
        let index_raw = b.read_index_raw(index_offset)?;
        let data_raw = b.read_data_raw(dc.offset)?;
        if index_raw != data_raw {
            log::error!(
                "blob: {}: {}: header copies disagree: base: {}, index_offset: {}",
                self.cfg.stat_id,
                key.dump(),
                b.num(),
                index_offset
            );
            return Err(Error::HeaderInconsistent);
        }

        if mode == ReadMode::Csum {
            self.verify_record(&b, &dc, index_offset)?;
        }
        b.read_payload(&dc, 0, dc.data_size)
    }

    /// Verify one record, persisting `CORRUPTED` on a fresh mismatch.
    pub(crate) fn verify_record(
        &self,
        b: &Arc<Base>,
        dc: &DiskControl,
        index_offset: u64,
    ) -> Result<()> {
        let wc = WriteControl::from_dc(dc, b.num(), index_offset);
        match footer::check(b.data_file(), &wc, !self.cfg.footers_enabled()) {
            Ok(()) => Ok(()),
            Err(Error::ChecksumMismatch) => {
                if let Some(_) = b.mark_corrupted(index_offset)? {
                    log::error!(
                        "blob: {}: {}: record marked corrupted: base: {}",
                        self.cfg.stat_id,
                        dc.key.dump(),
                        b.num()
                    );
                }
                Err(Error::ChecksumMismatch)
            }
            Err(err) => Err(err),
        }
    }

    fn remove(&self, key: &Key) -> Result<()> {
        let bases = self.bases.read().unwrap();
        let (b, _, index_offset) = self.locate(&bases, key)?.ok_or(Error::NotFound)?;
        b.mark_removed(index_offset)?;
        self.hash_index.remove(key);
        log::debug!(
            "blob: {}: {}: removed: base: {}",
            self.cfg.stat_id,
            key.dump(),
            b.num()
        );
        Ok(())
    }

    pub(crate) fn stat_get(&self, reg: StatRegister) -> i64 {
        match reg {
            StatRegister::RecordsTotal
            | StatRegister::RecordsRemoved
            | StatRegister::RemovedSize
            | StatRegister::RecordsCorrupted
            | StatRegister::CorruptedSize => {
                let bases = self.bases.read().unwrap();
                bases
                    .iter()
                    .map(|b| {
                        let state = b.state();
                        (match reg {
                            StatRegister::RecordsTotal => state.records,
                            StatRegister::RecordsRemoved => state.removed,
                            StatRegister::RemovedSize => state.removed_size,
                            StatRegister::RecordsCorrupted => state.corrupted,
                            StatRegister::CorruptedSize => state.corrupted_size,
                            _ => unreachable!(),
                        }) as i64
                    })
                    .sum()
            }
            other => self.stats.get(other),
        }
    }

    /// Datasort over explicit positions in the base list.
    pub(crate) fn datasort_positions(&self, positions: &[usize], mode: DefragState) -> Result<()> {
        let inputs = {
            let bases = self.bases.read().unwrap();
            let mut inputs = Vec::with_capacity(positions.len());
            for &pos in positions {
                let b = bases.get(pos).ok_or_else(|| {
                    Error::InvalidArgument(format!("no base at position {}", pos))
                })?;
                inputs.push(b.clone());
            }
            inputs
        };
        if inputs.is_empty() {
            return Err(Error::InvalidArgument("datasort needs at least one base".into()));
        }
        let chunks_dir = self.defrag_chunks_dir.lock().unwrap().clone();
        datasort::run(DatasortJob {
            cfg: &self.cfg,
            stats: &self.stats,
            hash_index: &self.hash_index,
            bases: &self.bases,
            inputs,
            mode,
            chunks_dir,
            cancel: &|| self.shutdown.load(Ordering::SeqCst),
        })
    }

    /// Candidate selection plus datasort, used by `defrag` and the
    /// background worker.
    pub(crate) fn run_defrag(&self, mode: DefragState, cancellable: bool) -> Result<()> {
        let inputs = {
            let bases = self.bases.read().unwrap();
            let len = bases.len();
            bases
                .iter()
                .take(len.saturating_sub(1))
                .filter(|b| {
                    b.dead_percentage() >= self.cfg.defrag_percentage as u64
                        || (mode == DefragState::DataSort && !b.is_sorted())
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        if inputs.is_empty() {
            self.stats.set(StatRegister::DatasortCompletionStatus, 0);
            return Ok(());
        }
        let chunks_dir = self.defrag_chunks_dir.lock().unwrap().clone();
        datasort::run(DatasortJob {
            cfg: &self.cfg,
            stats: &self.stats,
            hash_index: &self.hash_index,
            bases: &self.bases,
            inputs,
            mode,
            chunks_dir,
            cancel: &|| {
                self.shutdown.load(Ordering::SeqCst)
                    || (cancellable
                        && DefragState::from_raw(self.want_defrag.load(Ordering::SeqCst))
                            == DefragState::NotStarted)
            },
        })
    }

    pub(crate) fn fsync_bases(&self) {
        let bases = self.bases.read().unwrap();
        for b in bases.iter() {
            if let Err(err) = b.fsync_all() {
                log::warn!(
                    "blob: {}: periodic fsync of base {} failed: {}",
                    self.cfg.stat_id,
                    b.num(),
                    err
                );
            }
        }
    }
}

/// Take the exclusive advisory lock guarding the store directory.
///
/// Two backends over the same path would corrupt each other; the
/// flock makes the second `init` fail fast instead.
fn lock_backend_dir(prefix: &Path) -> Result<File> {
    let mut os = prefix.as_os_str().to_owned();
    os.push(".lock");
    let path = PathBuf::from(os);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            format!("backend lock {:?} is held by another instance", path),
        ))
    })?;
    Ok(file)
}

/// Numbers of the bases present below the configured path, sorted.
fn scan_base_numbers(cfg: &BlobConfig) -> Result<Vec<u64>> {
    let dir = cfg.base_dir();
    let name = match cfg.file.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Err(Error::InvalidArgument("config.file has no file name".into())),
    };
    let prefix = format!("{}.", name);

    let mut numbers = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(suffix) = file_name.strip_prefix(&prefix) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(num) = suffix.parse::<u64>() {
                    numbers.push(num);
                }
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}
