//! This module implements the record storage and access layer.
//!
//! # Data format
//!
//! The store operates over a directory holding a sequence of numbered
//! *bases*. Base `N` is the file pair `data.N` (variable length
//! records) and `data.N.index` (one fixed 96-byte disk-control header
//! per record, in write order). Once a base has been sorted its index
//! is replaced by `data.N.index.sorted`, the same header array in key
//! order, plus a bloom filter sidecar used to skip the base during
//! lookups.
//!
//! A record on disk is `[header | payload (padded to the record
//! alignment) | per-chunk CRC32 footers | summary footer]`. Payload is
//! checksummed in 1 MiB chunks; the summary footer is the CRC32 of
//! the per-chunk footer region. Records of older store versions carry
//! a single SHA-512 footer instead; those are still readable but
//! never written.
//!
//! # Removal and defragmentation
//!
//! Removing a record only flips the `REMOVED` bit in both header
//! copies. Space comes back when the background *datasort* merges one
//! or more bases into a single key-sorted output base and unlinks the
//! inputs. Sorted inputs can be reused as *views*, avoiding the data
//! rewrite entirely.
//!
//! # Locking
//!
//! The base list is guarded by a rwlock which every request takes
//! shared and only rotation and the datasort commit take exclusive.
//! Writes to one base serialize on that base's mutex. The in-RAM hash
//! index shards its buckets, each with its own lock.

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod base;
pub mod bloom;
pub mod config;
pub mod datasort;
pub mod disk_control;
pub mod error;
pub mod footer;
pub mod index;
pub mod periodic;
pub mod stats;

/// Checksum behaviour of a read request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Verify record checksums before returning the payload.
    Csum,
    /// Return the payload without verification.
    Nocsum,
}

/// State of the defragmentation request flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefragState {
    NotStarted,
    DataSort,
    DataCompact,
}

impl DefragState {
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            1 => DefragState::DataSort,
            2 => DefragState::DataCompact,
            _ => DefragState::NotStarted,
        }
    }

    pub(crate) fn as_raw(self) -> i32 {
        match self {
            DefragState::NotStarted => 0,
            DefragState::DataSort => 1,
            DefragState::DataCompact => 2,
        }
    }
}

/// State of the inspection request flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InspectState {
    NotStarted,
    Inspecting,
}

impl InspectState {
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            1 => InspectState::Inspecting,
            _ => InspectState::NotStarted,
        }
    }

    pub(crate) fn as_raw(self) -> i32 {
        match self {
            InspectState::NotStarted => 0,
            InspectState::Inspecting => 1,
        }
    }
}
