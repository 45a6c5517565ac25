use std::path::PathBuf;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

bitflags::bitflags! {
    /// Backend wide behaviour switches.
    pub struct BlobFlags: u64 {
        /// Bucket the in-RAM index by a derived 64-bit hash.
        const L2HASH = 0x01;
        /// Do not spawn the background maintenance thread.
        const DISABLE_THREADS = 0x02;
        /// Sort a base's index as soon as it rotates off active.
        const AUTO_INDEXSORT = 0x04;
        /// Allow datasort to reuse sorted bases as views.
        const USE_VIEWS = 0x08;
        /// Write records without any checksum footers.
        const NO_FOOTER = 0x10;
    }
}

impl Serialize for BlobFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for BlobFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(BlobFlags::from_bits_truncate(bits))
    }
}

pub const DEFAULT_BLOB_SIZE: u64 = 50 * 1024 * 1024 * 1024;
pub const DEFAULT_RECORDS_IN_BLOB: u64 = 50_000_000;
pub const DEFAULT_DEFRAG_PERCENTAGE: u32 = 25;
pub const DEFAULT_DEFRAG_TIME: u32 = 3;
pub const DEFAULT_DEFRAG_SPLAY: u32 = 3;
pub const DEFAULT_INDEX_BLOCK_SIZE: u32 = 40;
pub const DEFAULT_INDEX_BLOCK_BLOOM_LENGTH: u32 = 128;
pub const DEFAULT_PERIODIC_TIMEOUT: u64 = 15;

/// Backend configuration.
///
/// `file` is the base path: records for base `N` live in
/// `<file>.N` / `<file>.N.index` next to it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BlobConfig {
    pub blob_flags: BlobFlags,

    /// Base path of the data files.
    pub file: PathBuf,

    /// Rotate the active base when its data file reaches this size.
    pub blob_size: u64,
    /// Rotate the active base when it holds this many records.
    pub records_in_blob: u64,
    /// Hard cap on the summed data size of all bases, 0 = unlimited.
    pub blob_size_limit: u64,

    /// Defragment a base once this percentage of it is dead.
    pub defrag_percentage: u32,
    /// Seconds between scheduled defrag runs, <= 0 disables them.
    pub defrag_timeout: i64,
    /// Hour (UTC) around which scheduled defrag runs are allowed.
    pub defrag_time: u32,
    /// Half-width in hours of the allowed defrag window.
    pub defrag_splay: u32,

    /// Records per block of the sorted index block cache.
    pub index_block_size: u32,
    /// Byte length of a sorted base's bloom filter sidecar.
    pub index_block_bloom_length: u32,

    /// Seconds between background timer ticks.
    pub periodic_timeout: u64,

    /// Fsync policy: < 0 never, 0 after every commit, > 0 every
    /// `sync` seconds from the background loop.
    pub sync: i32,

    /// Scratch directory for datasort chunk files; the base directory
    /// is used when unset or unusable.
    pub chunks_dir: Option<PathBuf>,

    /// Inputs at least this large are sorted in a single in-memory
    /// pass during datasort; 0 disables single-pass views.
    pub single_pass_file_size_threshold: u64,

    /// Identifier included in log lines, useful when one process
    /// embeds several backends.
    pub stat_id: u32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            blob_flags: BlobFlags::empty(),
            file: PathBuf::new(),
            blob_size: DEFAULT_BLOB_SIZE,
            records_in_blob: DEFAULT_RECORDS_IN_BLOB,
            blob_size_limit: 0,
            defrag_percentage: DEFAULT_DEFRAG_PERCENTAGE,
            defrag_timeout: -1,
            defrag_time: DEFAULT_DEFRAG_TIME,
            defrag_splay: DEFAULT_DEFRAG_SPLAY,
            index_block_size: DEFAULT_INDEX_BLOCK_SIZE,
            index_block_bloom_length: DEFAULT_INDEX_BLOCK_BLOOM_LENGTH,
            periodic_timeout: DEFAULT_PERIODIC_TIMEOUT,
            sync: 30,
            chunks_dir: None,
            single_pass_file_size_threshold: 0,
            stat_id: 0,
        }
    }
}

impl BlobConfig {
    /// Directory holding the base files.
    pub fn base_dir(&self) -> PathBuf {
        self.file
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub(crate) fn footers_enabled(&self) -> bool {
        !self.blob_flags.contains(BlobFlags::NO_FOOTER)
    }

    pub(crate) fn threads_enabled(&self) -> bool {
        !self.blob_flags.contains(BlobFlags::DISABLE_THREADS)
    }
}
