//! Defragmentation by merge-sort.
//!
//! Datasort takes an ordered set of input bases and produces one
//! output base holding their live records, globally sorted by key
//! (`DATA_SORT`) or simply compacted in arrival order
//! (`DATA_COMPACT`). Inputs are unlinked after the output is fsynced
//! and atomically renamed into place.
//!
//! Unsorted inputs are streamed through scratch *chunk* files: live
//! records are partitioned into bounded chunks, each chunk is sorted
//! in memory (headers only, payload moves once) and rewritten in key
//! order, and a k-way merge drains the sorted chunks. Two shortcuts
//! avoid the rewrite when `USE_VIEWS` is enabled: an already sorted
//! input is merged straight from its sorted index (*sorted view*),
//! and a small unsorted input is sorted in one in-memory pass
//! (*single-pass view*). When a lone view input is sorted, only the
//! index sidecar is rewritten and the data file is reused in place.
//!
//! Cancellation is cooperative: the caller's cancel check runs
//! between phases and between every merged record.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::store::base::{self, Base};
use crate::store::bloom::Bloom;
use crate::store::config::{BlobConfig, BlobFlags};
use crate::store::disk_control::{DcFlags, DiskControl, Key, DISK_CONTROL_SIZE};
use crate::store::error::{Error, Result};
use crate::store::index::{HashIndex, RamControl};
use crate::store::stats::{StatRegister, Stats};
use crate::store::DefragState;
use crate::tools::file::{copy_range, fsync, read_all_at, write_all_at};

const DC_SIZE: u64 = DISK_CONTROL_SIZE as u64;

/// Upper bound on one scratch chunk file.
const SORT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) struct DatasortJob<'a> {
    pub cfg: &'a BlobConfig,
    pub stats: &'a Stats,
    pub hash_index: &'a HashIndex,
    pub bases: &'a RwLock<Vec<Arc<Base>>>,
    pub inputs: Vec<Arc<Base>>,
    pub mode: DefragState,
    /// Scratch directory override from `start_defrag_in_dir`.
    pub chunks_dir: Option<PathBuf>,
    pub cancel: &'a dyn Fn() -> bool,
}

/// Run one datasort job and record its completion status.
pub(crate) fn run(job: DatasortJob) -> Result<()> {
    let stats = job.stats;
    let stat_id = job.cfg.stat_id;
    let result = run_inner(job);
    let status = match &result {
        Ok(()) => 0,
        Err(err) => err.errno() as i64,
    };
    stats.set(StatRegister::DatasortCompletionStatus, status);
    match &result {
        Ok(()) => log::info!("blob: {}: datasort: completed", stat_id),
        Err(err) => log::error!("blob: {}: datasort: failed: {}", stat_id, err),
    }
    result
}

fn run_inner(job: DatasortJob) -> Result<()> {
    if job.inputs.is_empty() {
        return Err(Error::InvalidArgument("datasort needs at least one input base".into()));
    }
    if job.mode == DefragState::NotStarted {
        return Err(Error::InvalidArgument("datasort needs a mode".into()));
    }

    let _sorting = SortingGuard::raise(&job.inputs);
    let use_views = job.mode == DefragState::DataSort
        && job.cfg.blob_flags.contains(BlobFlags::USE_VIEWS);

    // Chunk + sort phases: turn every input into one or more streams
    // of live records in merge order.
    let mut scratch = Scratch::new(&job)?;
    let mut streams: Vec<Stream> = Vec::new();
    let mut lone_view = job.inputs.len() == 1;
    for (pos, input) in job.inputs.iter().enumerate() {
        check_cancel(job.cancel)?;
        if use_views && input.is_sorted() {
            job.stats.add(StatRegister::DatasortViewUsed, 1);
            job.stats.add(StatRegister::DatasortSortedViewUsed, 1);
            streams.push(Stream::index_order(input.clone(), pos));
        } else if use_views
            && job.cfg.single_pass_file_size_threshold > 0
            && input.data_size() >= job.cfg.single_pass_file_size_threshold
        {
            job.stats.add(StatRegister::DatasortViewUsed, 1);
            job.stats.add(StatRegister::DatasortSinglePassViewUsed, 1);
            streams.push(Stream::single_pass(input.clone(), pos)?);
        } else {
            lone_view = false;
            if job.mode == DefragState::DataSort {
                chunk_and_sort(&job, &mut scratch, input, pos, &mut streams)?;
            } else {
                streams.push(Stream::index_order(input.clone(), pos));
            }
        }
    }

    if lone_view {
        // single view input: reuse the data file, rewrite the index
        drop(streams);
        return commit_view(&job);
    }

    // Merge phase.
    let prefix = &job.cfg.file;
    let first_num = job.inputs[0].num();
    let sorted_output = job.mode == DefragState::DataSort;
    let mut output = Output::create(prefix, first_num, sorted_output, job.cfg)?;

    for stream in streams.iter_mut() {
        stream.advance(job.cancel)?;
    }
    loop {
        check_cancel(job.cancel)?;
        let next = if sorted_output {
            pick_min_key(&streams)
        } else {
            streams.iter().position(|s| s.current().is_some())
        };
        let lead = match next {
            Some(pos) => pos,
            None => break,
        };

        if sorted_output {
            let key = streams[lead].current().expect("picked stream has a record").0.key;
            // equal keys across inputs: the newest input wins, older
            // copies are dropped
            let mut winner = lead;
            for (pos, stream) in streams.iter().enumerate() {
                if let Some((dc, _)) = stream.current() {
                    if dc.key == key && stream.input_pos() >= streams[winner].input_pos() {
                        winner = pos;
                    }
                }
            }
            output.push(&streams[winner])?;
            for stream in streams.iter_mut() {
                if let Some((dc, _)) = stream.current() {
                    if dc.key == key {
                        stream.advance(job.cancel)?;
                    }
                }
            }
        } else {
            output.push(&streams[lead])?;
            streams[lead].advance(job.cancel)?;
        }
    }

    scratch.cleanup();
    commit_output(&job, output)
}

fn check_cancel(cancel: &dyn Fn() -> bool) -> Result<()> {
    if cancel() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Marks the inputs as being sorted for the duration of the job so
/// foreground writes fall back to the append path.
struct SortingGuard {
    bases: Vec<Arc<Base>>,
}

impl SortingGuard {
    fn raise(inputs: &[Arc<Base>]) -> Self {
        for base in inputs {
            base.sorting.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        Self {
            bases: inputs.to_vec(),
        }
    }
}

impl Drop for SortingGuard {
    fn drop(&mut self) {
        for base in &self.bases {
            base.sorting.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// Scratch file management for the chunk phase.
struct Scratch {
    dir: PathBuf,
    created_dir: bool,
    counter: u64,
    live: Vec<PathBuf>,
}

impl Scratch {
    fn new(job: &DatasortJob) -> Result<Self> {
        let base_dir = job.cfg.base_dir();
        let mut candidates = Vec::new();
        if let Some(ref dir) = job.chunks_dir {
            candidates.push(dir.clone());
        }
        if let Some(ref dir) = job.cfg.chunks_dir {
            candidates.push(dir.clone());
        }
        candidates.push(base_dir.clone());

        for candidate in candidates {
            let dir = candidate.join(format!("datasort.{}.tmp", job.inputs[0].num()));
            // leftovers of a crashed run are stale by definition
            let _ = std::fs::remove_dir_all(&dir);
            match std::fs::create_dir_all(&dir) {
                Ok(()) => {
                    return Ok(Self {
                        dir,
                        created_dir: true,
                        counter: 0,
                        live: Vec::new(),
                    })
                }
                Err(err) => {
                    log::warn!(
                        "blob: {}: datasort: scratch dir {:?} unusable: {}",
                        job.cfg.stat_id,
                        dir,
                        err
                    );
                }
            }
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "no usable datasort scratch directory",
        )))
    }

    fn create_file(&mut self) -> Result<(File, PathBuf)> {
        let path = self.dir.join(format!("chunk.{}", self.counter));
        self.counter += 1;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.live.push(path.clone());
        Ok((file, path))
    }

    fn remove_file(&mut self, path: &Path) {
        let _ = std::fs::remove_file(path);
        self.live.retain(|p| p != path);
    }

    fn cleanup(&mut self) {
        for path in self.live.drain(..) {
            let _ = std::fs::remove_file(&path);
        }
        if self.created_dir {
            let _ = std::fs::remove_dir(&self.dir);
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// One sorted source of live records feeding the merge.
///
/// `current` is `(dc, src_index_offset)`; `dc.offset` points into
/// [`Stream::file`], which is the input base's data file for view
/// streams and a sorted scratch file for chunk streams.
enum Stream {
    Index {
        base: Arc<Base>,
        input_pos: usize,
        slot: u64,
        records: u64,
        current: Option<(DiskControl, u64)>,
    },
    Mem {
        base: Arc<Base>,
        input_pos: usize,
        list: Vec<(DiskControl, u64)>,
        pos: usize,
        current: Option<(DiskControl, u64)>,
    },
    Chunk {
        file: File,
        input_pos: usize,
        list: Vec<(DiskControl, u64)>,
        pos: usize,
        current: Option<(DiskControl, u64)>,
    },
}

impl Stream {
    fn index_order(base: Arc<Base>, input_pos: usize) -> Stream {
        let records = base.state().records;
        Stream::Index {
            base,
            input_pos,
            slot: 0,
            records,
            current: None,
        }
    }

    fn single_pass(base: Arc<Base>, input_pos: usize) -> Result<Stream> {
        let mut list = Vec::new();
        base.for_each_record(true, |dc, index_offset| {
            list.push((dc, index_offset));
            Ok(true)
        })?;
        list.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        Ok(Stream::Mem {
            base,
            input_pos,
            list,
            pos: 0,
            current: None,
        })
    }

    fn input_pos(&self) -> usize {
        match self {
            Stream::Index { input_pos, .. } => *input_pos,
            Stream::Mem { input_pos, .. } => *input_pos,
            Stream::Chunk { input_pos, .. } => *input_pos,
        }
    }

    fn current(&self) -> Option<&(DiskControl, u64)> {
        match self {
            Stream::Index { current, .. } => current.as_ref(),
            Stream::Mem { current, .. } => current.as_ref(),
            Stream::Chunk { current, .. } => current.as_ref(),
        }
    }

    fn file(&self) -> &File {
        match self {
            Stream::Index { base, .. } => base.data_file(),
            Stream::Mem { base, .. } => base.data_file(),
            Stream::Chunk { file, .. } => file,
        }
    }

    fn advance(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        check_cancel(cancel)?;
        match self {
            Stream::Index {
                base,
                slot,
                records,
                current,
                ..
            } => {
                *current = None;
                while *slot < *records {
                    let index_offset = *slot * DC_SIZE;
                    let dc = base.read_index_dc(index_offset)?;
                    *slot += 1;
                    if dc.is_removed() {
                        continue;
                    }
                    *current = Some((dc, index_offset));
                    break;
                }
                Ok(())
            }
            Stream::Mem {
                list, pos, current, ..
            }
            | Stream::Chunk {
                list, pos, current, ..
            } => {
                *current = list.get(*pos).copied();
                *pos += 1;
                Ok(())
            }
        }
    }
}

/// Partition one unsorted input into sorted scratch chunks.
///
/// Records land in arrival order first; each full chunk gets its
/// headers sorted in memory and is rewritten once in key order.
/// Corrupted records are copied verbatim so the flag survives.
fn chunk_and_sort(
    job: &DatasortJob,
    scratch: &mut Scratch,
    input: &Arc<Base>,
    input_pos: usize,
    streams: &mut Vec<Stream>,
) -> Result<()> {
    struct ChunkBuilder {
        file: File,
        path: PathBuf,
        size: u64,
        list: Vec<(DiskControl, u64)>,
    }

    let mut building: Vec<ChunkBuilder> = Vec::new();
    let mut cur: Option<ChunkBuilder> = None;

    input.for_each_record(true, |dc, index_offset| {
        check_cancel(job.cancel)?;
        let need_new = match cur {
            Some(ref c) => c.size + dc.disk_size > SORT_CHUNK_SIZE && !c.list.is_empty(),
            None => true,
        };
        if need_new {
            if let Some(done) = cur.take() {
                building.push(done);
            }
            let (file, path) = scratch.create_file()?;
            cur = Some(ChunkBuilder {
                file,
                path,
                size: 0,
                list: Vec::new(),
            });
        }
        let chunk = cur.as_mut().expect("chunk builder exists after need_new");
        copy_range(
            input.data_file(),
            dc.offset,
            &chunk.file,
            chunk.size,
            dc.disk_size,
        )?;
        let mut local = dc;
        local.offset = chunk.size;
        chunk.list.push((local, index_offset));
        chunk.size += dc.disk_size;
        Ok(true)
    })?;
    if let Some(done) = cur.take() {
        building.push(done);
    }

    // sort phase: headers sort in memory, payload moves once
    for mut chunk in building {
        check_cancel(job.cancel)?;
        chunk.list.sort_by(|a, b| a.0.key.cmp(&b.0.key));

        let (sorted_file, _sorted_path) = scratch.create_file()?;
        let mut offset = 0u64;
        let mut sorted_list = Vec::with_capacity(chunk.list.len());
        for (dc, index_offset) in chunk.list {
            copy_range(&chunk.file, dc.offset, &sorted_file, offset, dc.disk_size)?;
            let mut out = dc;
            out.offset = offset;
            sorted_list.push((out, index_offset));
            offset += dc.disk_size;
        }
        scratch.remove_file(&chunk.path);

        streams.push(Stream::Chunk {
            file: sorted_file,
            input_pos,
            list: sorted_list,
            pos: 0,
            current: None,
        });
    }
    Ok(())
}

fn pick_min_key(streams: &[Stream]) -> Option<usize> {
    let mut best: Option<(usize, Key)> = None;
    for (pos, stream) in streams.iter().enumerate() {
        if let Some((dc, _)) = stream.current() {
            match best {
                Some((_, ref key)) if *key <= dc.key => {}
                _ => best = Some((pos, dc.key)),
            }
        }
    }
    best.map(|(pos, _)| pos)
}

struct OutMeta {
    key: Key,
    out_ctl_offset: u64,
    out_index_offset: u64,
    input_pos: usize,
    src_index_offset: u64,
}

struct Output {
    num: u64,
    sorted: bool,
    data: File,
    index: File,
    data_path: PathBuf,
    index_path: PathBuf,
    append_offset: u64,
    index_size: u64,
    bloom: Bloom,
    metas: Vec<OutMeta>,
}

impl Output {
    fn create(prefix: &Path, num: u64, sorted: bool, cfg: &BlobConfig) -> Result<Self> {
        let data_path = datasort_tmp_path(prefix, num, "data");
        let index_path = datasort_tmp_path(prefix, num, "index");
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&index_path)?;
        Ok(Self {
            num,
            sorted,
            data,
            index,
            data_path,
            index_path,
            append_offset: 0,
            index_size: 0,
            bloom: Bloom::new(cfg.index_block_bloom_length),
            metas: Vec::new(),
        })
    }

    fn push(&mut self, stream: &Stream) -> Result<()> {
        let (dc, src_index_offset) = *stream.current().expect("push needs a current record");

        copy_range(
            stream.file(),
            dc.offset,
            &self.data,
            self.append_offset,
            dc.disk_size,
        )?;
        let mut out_dc = dc;
        out_dc.offset = self.append_offset;
        let bytes = out_dc.to_bytes();
        write_all_at(&self.data, &bytes, self.append_offset)?;
        write_all_at(&self.index, &bytes, self.index_size)?;
        self.bloom.insert(&dc.key);

        self.metas.push(OutMeta {
            key: dc.key,
            out_ctl_offset: self.append_offset,
            out_index_offset: self.index_size,
            input_pos: stream.input_pos(),
            src_index_offset,
        });
        self.append_offset += dc.disk_size;
        self.index_size += DC_SIZE;
        Ok(())
    }

    fn discard(self) {
        let _ = std::fs::remove_file(&self.data_path);
        let _ = std::fs::remove_file(&self.index_path);
    }
}

fn datasort_tmp_path(prefix: &Path, num: u64, kind: &str) -> PathBuf {
    let mut os = prefix.as_os_str().to_owned();
    os.push(format!(".{}.datasort.{}", num, kind));
    PathBuf::from(os)
}

/// Swap a fully rewritten output base in for the inputs.
fn commit_output(job: &DatasortJob, mut output: Output) -> Result<()> {
    let prefix = &job.cfg.file;
    let mut bases = job.bases.write().unwrap();

    // settle races with foreground removes: any output record whose
    // source died since it was streamed is marked removed in place
    let mut live = 0u64;
    for meta in &output.metas {
        let src = &job.inputs[meta.input_pos];
        let now = src.read_index_dc(meta.src_index_offset)?;
        if !now.is_removed() {
            live += 1;
            continue;
        }
        let mut buf = [0u8; DISK_CONTROL_SIZE];
        read_all_at(&output.index, &mut buf, meta.out_index_offset)?;
        let mut dc = DiskControl::from_bytes(&buf)?;
        dc.flags |= DcFlags::REMOVED;
        let bytes = dc.to_bytes();
        write_all_at(&output.index, &bytes, meta.out_index_offset)?;
        write_all_at(&output.data, &bytes, meta.out_ctl_offset)?;
    }

    if live == 0 {
        log::info!(
            "blob: {}: datasort: all input records dead, dropping {} input base(s)",
            job.cfg.stat_id,
            job.inputs.len()
        );
        output.discard();
        remove_inputs(job, &mut bases, None)?;
        return Ok(());
    }

    if job.cfg.sync >= 0 {
        fsync(&output.data)?;
        fsync(&output.index)?;
    }

    // rename into place next to the inputs
    let final_data = base::data_path(prefix, output.num);
    std::fs::rename(&output.data_path, &final_data)?;
    if output.sorted {
        let final_index = base::sorted_index_path(prefix, output.num);
        std::fs::rename(&output.index_path, &final_index)?;
        output.bloom.save(&base::bloom_path(prefix, output.num))?;
        let _ = std::fs::remove_file(base::index_path(prefix, output.num));
    } else {
        let final_index = base::index_path(prefix, output.num);
        std::fs::rename(&output.index_path, &final_index)?;
        let _ = std::fs::remove_file(base::sorted_index_path(prefix, output.num));
        let _ = std::fs::remove_file(base::bloom_path(prefix, output.num));
    }

    let new_base = Arc::new(Base::open(prefix, output.num, job.cfg)?);
    remove_inputs(job, &mut bases, Some(new_base.clone()))?;

    if !new_base.is_sorted() {
        // compact output stays in the RAM hash index
        new_base.for_each_record(true, |dc, index_offset| {
            job.hash_index.insert(
                dc.key,
                RamControl {
                    base_num: new_base.num(),
                    index_offset,
                },
            );
            Ok(true)
        })?;
    }
    Ok(())
}

/// Unlink all inputs, dropping their hash entries; `replacement`
/// takes the first input's position in the base list.
fn remove_inputs(
    job: &DatasortJob,
    bases: &mut Vec<Arc<Base>>,
    replacement: Option<Arc<Base>>,
) -> Result<()> {
    let prefix = &job.cfg.file;
    let first_pos = bases
        .iter()
        .position(|b| Arc::ptr_eq(b, &job.inputs[0]))
        .ok_or_else(|| Error::InvalidArgument("datasort input vanished from base list".into()))?;

    bases.retain(|b| !job.inputs.iter().any(|input| Arc::ptr_eq(b, input)));
    if let Some(new_base) = replacement {
        let pos = first_pos.min(bases.len());
        bases.insert(pos, new_base);
    }
    if bases.is_empty() {
        // never leave the backend without a writable base
        let next = job.inputs.iter().map(|b| b.num()).max().unwrap_or(0) + 1;
        bases.push(Arc::new(Base::create(prefix, next, job.cfg)?));
    }

    for input in &job.inputs {
        job.hash_index.remove_base(input.num());
        // the replacement was renamed over the first input's files
        // already and its stale siblings were handled at that point
        if !bases.iter().any(|b| b.num() == input.num()) {
            input.unlink_files(prefix)?;
        }
    }
    Ok(())
}

/// Index-only commit for a single view input: keep the data file,
/// rewrite the sorted index sidecar without the dead records.
///
/// Runs entirely under the exclusive base-list lock, which keeps
/// every foreground request out, so the index read here is already
/// the settled state.
fn commit_view(job: &DatasortJob) -> Result<()> {
    let prefix = &job.cfg.file;
    let input = &job.inputs[0];
    let mut bases = job.bases.write().unwrap();

    let mut live: Vec<DiskControl> = Vec::new();
    input.for_each_record(true, |dc, _| {
        live.push(dc);
        Ok(true)
    })?;
    if !input.is_sorted() {
        // single-pass view over an unsorted input
        live.sort_by(|a, b| a.key.cmp(&b.key));
    }

    if live.is_empty() {
        remove_inputs(job, &mut bases, None)?;
        return Ok(());
    }

    let tmp_index = datasort_tmp_path(prefix, input.num(), "index");
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_index)?;
        let mut bloom = Bloom::new(job.cfg.index_block_bloom_length);
        let mut offset = 0u64;
        for dc in &live {
            write_all_at(&file, &dc.to_bytes(), offset)?;
            bloom.insert(&dc.key);
            offset += DC_SIZE;
        }
        if job.cfg.sync >= 0 {
            fsync(&file)?;
        }
        bloom.save(&base::bloom_path(prefix, input.num()))?;
    }
    std::fs::rename(&tmp_index, &base::sorted_index_path(prefix, input.num()))?;
    let _ = std::fs::remove_file(base::index_path(prefix, input.num()));

    let new_base = Arc::new(Base::open(prefix, input.num(), job.cfg)?);
    let pos = bases
        .iter()
        .position(|b| Arc::ptr_eq(b, input))
        .ok_or_else(|| Error::InvalidArgument("datasort input vanished from base list".into()))?;
    bases[pos] = new_base;
    job.hash_index.remove_base(input.num());

    log::info!(
        "blob: {}: datasort: committed view over base {} ({} live records)",
        job.cfg.stat_id,
        input.num(),
        live.len()
    );
    Ok(())
}
