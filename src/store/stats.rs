//! Backend statistics registers.
//!
//! A fixed file of signed 64-bit counters updated with relaxed
//! atomics. Record accounting (totals, removed, corrupted) is not
//! kept here but derived from the per-base state under each base's
//! mutex, so those registers can never drift from the disk state;
//! see [`crate::Backend::stat_get`].

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Addressable counters, see [`crate::Backend::stat_get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatRegister {
    /// Live records whose `CORRUPTED` bit is set.
    RecordsCorrupted,
    /// Summed payload size of those records.
    CorruptedSize,
    /// Negative errno of the last datasort, 0 on success.
    DatasortCompletionStatus,
    /// Inputs streamed as views by datasort.
    DatasortViewUsed,
    /// Inputs streamed as already-sorted views.
    DatasortSortedViewUsed,
    /// Inputs sorted in one in-memory pass.
    DatasortSinglePassViewUsed,
    /// Records across all bases, dead ones included.
    RecordsTotal,
    /// Records marked removed.
    RecordsRemoved,
    /// Disk bytes held by removed records.
    RemovedSize,
}

const REGISTER_COUNT: usize = 9;

impl StatRegister {
    fn slot(self) -> usize {
        match self {
            StatRegister::RecordsCorrupted => 0,
            StatRegister::CorruptedSize => 1,
            StatRegister::DatasortCompletionStatus => 2,
            StatRegister::DatasortViewUsed => 3,
            StatRegister::DatasortSortedViewUsed => 4,
            StatRegister::DatasortSinglePassViewUsed => 5,
            StatRegister::RecordsTotal => 6,
            StatRegister::RecordsRemoved => 7,
            StatRegister::RemovedSize => 8,
        }
    }
}

#[derive(Default)]
pub struct Stats {
    regs: [AtomicI64; REGISTER_COUNT],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: StatRegister) -> i64 {
        self.regs[reg.slot()].load(Ordering::Relaxed)
    }

    pub fn add(&self, reg: StatRegister, value: i64) {
        self.regs[reg.slot()].fetch_add(value, Ordering::Relaxed);
    }

    pub fn set(&self, reg: StatRegister, value: i64) {
        self.regs[reg.slot()].store(value, Ordering::Relaxed);
    }

}

/// Point-in-time copy of all registers, serializable to JSON.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub records_total: i64,
    pub records_removed: i64,
    pub removed_size: i64,
    pub records_corrupted: i64,
    pub corrupted_size: i64,
    pub datasort_completion_status: i64,
    pub datasort_view_used: i64,
    pub datasort_sorted_view_used: i64,
    pub datasort_single_pass_view_used: i64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
