//! Background maintenance worker.
//!
//! One thread per backend polls the `want_inspect` / `want_defrag`
//! request flags and a periodic timer. At most one inspection or
//! defrag job runs at a time. The worker demotes itself to the idle
//! I/O class for its lifetime so foreground requests keep priority.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::store::backend::Shared;
use crate::store::error::{Error, Result};
use crate::store::{DefragState, InspectState};
use crate::tools::ioprio;

pub(crate) fn spawn(shared: Arc<Shared>, rx: Receiver<()>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("blobstore-periodic".into())
        .spawn(move || worker_loop(shared, rx))
        .expect("spawning the periodic worker")
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<()>) {
    let previous_ioprio = ioprio::set_idle();
    let mut last_scheduled_defrag = Instant::now();
    let mut last_sync = Instant::now();

    loop {
        let timeout = Duration::from_secs(shared.cfg.periodic_timeout.max(1));
        match rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // scheduled defrag: only inside the configured daily window
        if shared.cfg.defrag_timeout > 0
            && last_scheduled_defrag.elapsed().as_secs() >= shared.cfg.defrag_timeout as u64
            && in_defrag_window(shared.cfg.defrag_time, shared.cfg.defrag_splay)
            && DefragState::from_raw(shared.want_defrag.load(Ordering::SeqCst))
                == DefragState::NotStarted
        {
            shared
                .want_defrag
                .store(DefragState::DataSort.as_raw(), Ordering::SeqCst);
        }

        if InspectState::from_raw(shared.want_inspect.load(Ordering::SeqCst))
            == InspectState::Inspecting
        {
            if let Err(err) = run_inspection(&shared) {
                log::error!("blob: {}: inspection failed: {}", shared.cfg.stat_id, err);
            }
            shared
                .want_inspect
                .store(InspectState::NotStarted.as_raw(), Ordering::SeqCst);
        }

        let mode = DefragState::from_raw(shared.want_defrag.load(Ordering::SeqCst));
        if mode != DefragState::NotStarted {
            match shared.run_defrag(mode, true) {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    log::info!("blob: {}: defrag cancelled", shared.cfg.stat_id)
                }
                Err(err) => log::error!("blob: {}: defrag failed: {}", shared.cfg.stat_id, err),
            }
            shared
                .want_defrag
                .store(DefragState::NotStarted.as_raw(), Ordering::SeqCst);
            last_scheduled_defrag = Instant::now();
        }

        if shared.cfg.sync > 0
            && last_sync.elapsed().as_secs() >= shared.cfg.sync as u64
        {
            shared.fsync_bases();
            last_sync = Instant::now();
        }
    }

    if let Some(prev) = previous_ioprio {
        ioprio::set(prev);
    }
}

/// True when the UTC hour is within `defrag_time ± defrag_splay`.
fn in_defrag_window(defrag_time: u32, defrag_splay: u32) -> bool {
    let splay = defrag_splay as u64;
    if splay >= 12 {
        return true;
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let hour = (secs / 3600) % 24;
    let target = (defrag_time as u64) % 24;
    let diff = (24 + hour - target) % 24;
    diff <= splay || diff >= 24 - splay
}

/// Full checksum sweep over every base.
///
/// Verifies each live record, persisting `CORRUPTED` bits and the
/// corruption counters through the usual read-path marking. Records
/// already marked corrupted stay accounted and are not re-verified.
/// The sweep yields between records and stops on shutdown or when
/// the inspect flag is cleared.
pub(crate) fn run_inspection(shared: &Shared) -> Result<()> {
    let bases: Vec<_> = shared.bases.read().unwrap().clone();

    let mut checked = 0u64;
    let mut corrupted = 0u64;
    for b in &bases {
        b.for_each_record(true, |dc, index_offset| {
            if shared.shutdown.load(Ordering::SeqCst)
                || InspectState::from_raw(shared.want_inspect.load(Ordering::SeqCst))
                    != InspectState::Inspecting
            {
                return Err(Error::Cancelled);
            }
            if dc.is_corrupted() {
                return Ok(true);
            }
            checked += 1;
            match shared.verify_record(b, &dc, index_offset) {
                Ok(()) => {}
                Err(Error::ChecksumMismatch) => corrupted += 1,
                Err(err) => return Err(err),
            }
            thread::yield_now();
            Ok(true)
        })?;
    }

    log::info!(
        "blob: {}: inspection done: checked: {}, newly corrupted: {}",
        shared.cfg.stat_id,
        checked,
        corrupted
    );
    Ok(())
}
