//! Embedded append-only blob store.
//!
//! Opaque byte payloads are kept on local disk indexed by fixed
//! 64-byte keys. Records live in numbered *bases* (a data file plus a
//! compact index file), carry per-chunk CRC32 integrity footers, and
//! are reclaimed by a background defragmentation pass that merges and
//! sorts bases. See the [store](store/index.html) module for the data
//! format description.

pub mod store;
pub mod tools;

pub use store::backend::{Backend, BaseInfo, IterateControl, IterateFlags, RecordReader};
pub use store::config::{BlobConfig, BlobFlags};
pub use store::disk_control::{DcFlags, DiskControl, Key, WriteControl};
pub use store::error::{Error, Result};
pub use store::stats::{StatRegister, StatsSnapshot};
pub use store::{DefragState, InspectState, ReadMode};
