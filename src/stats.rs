//! Process-wide decompression statistics.
//!
//! This is the only shared state in the crate. Collection is off unless the
//! `NXFLATE_STATS` environment variable is set, so the mutex is never
//! touched on the fast path of an unmeasured process.

use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Number of 4 KiB buckets in the buffer-size histograms.
pub const SIZE_SLOTS: usize = 16;

/// Counters accumulated across all streams of the process.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Streams created.
    pub init: u64,
    /// `decompress` calls.
    pub inflate: u64,
    /// Compressed bytes offered across all `decompress` calls.
    pub inflate_len: u64,
    /// Jobs submitted to the accelerator, retries included.
    pub jobs: u64,
    /// Jobs that suspended with a partial completion.
    pub partial_completions: u64,
    /// Resubmissions after a target-space overflow.
    pub target_space_retries: u64,
    /// Resubmissions after a translation fault.
    pub translation_retries: u64,
    /// Histogram of caller input sizes, 4 KiB per slot.
    pub inflate_avail_in: [u64; SIZE_SLOTS],
    /// Histogram of caller output sizes, 4 KiB per slot.
    pub inflate_avail_out: [u64; SIZE_SLOTS],
}

static STATS: Lazy<Mutex<Stats>> = Lazy::new(|| Mutex::new(Stats::default()));
static ENABLED: Lazy<bool> = Lazy::new(|| std::env::var_os("NXFLATE_STATS").is_some());

/// Histogram slot for a buffer of `len` bytes.
pub fn size_slot(len: usize) -> usize {
    (len / 4096).min(SIZE_SLOTS - 1)
}

pub(crate) fn with<F: FnOnce(&mut Stats)>(f: F) {
    if *ENABLED {
        if let Ok(mut guard) = STATS.lock() {
            f(&mut guard);
        }
    }
}

/// A copy of the current counters.
pub fn snapshot() -> Stats {
    STATS.lock().map(|g| g.clone()).unwrap_or_default()
}
