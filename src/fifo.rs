//! Page-aligned staging buffers bridging the caller's byte-stream view and
//! the accelerator's descriptor-list view.
//!
//! `FifoIn` concatenates small caller inputs so that per-job overhead is
//! amortized; `FifoOut` holds the established 32 KiB history window behind
//! its cursor and queues overflow output past it. Both are compacted with a
//! half-full predicate so the cursors never run away.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::INF_HIS_LEN;

/// Page-aligned, zero-initialized heap buffer.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

impl AlignedBuf {
    /// Returns `None` when the allocator fails, so callers can surface a
    /// memory error instead of aborting.
    pub fn zeroed(len: usize, align: usize) -> Option<AlignedBuf> {
        let align = align.max(1).next_power_of_two();
        let layout = Layout::from_size_align(len.max(1), align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| AlignedBuf { ptr, len, align })
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(1), self.align).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

unsafe impl Send for AlignedBuf {}

/// Input staging buffer. Bytes `[cur, cur + used)` hold pending compressed
/// data copied from the caller.
pub(crate) struct FifoIn {
    buf: AlignedBuf,
    pub cur: usize,
    pub used: usize,
}

impl FifoIn {
    pub fn new(len: usize, align: usize) -> Option<FifoIn> {
        Some(FifoIn {
            buf: AlignedBuf::zeroed(len, align)?,
            cur: 0,
            used: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.cur..self.cur + self.used]
    }

    /// Compaction: once the cursor passes the halfway mark, slide the
    /// pending bytes back to the buffer start.
    pub fn len_check(&mut self) {
        if self.cur > self.len() / 2 {
            self.buf.copy_within(self.cur..self.cur + self.used, 0);
            self.cur = 0;
        }
    }

    /// Copies as much of `src` as fits and returns the number taken.
    pub fn stage(&mut self, src: &[u8]) -> usize {
        if self.used == 0 {
            self.cur = 0;
        }
        self.len_check();
        let free = self.len() - self.cur - self.used;
        let n = free.min(src.len());
        let at = self.cur + self.used;
        self.buf[at..at + n].copy_from_slice(&src[..n]);
        self.used += n;
        n
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.used -= n;
        self.cur += n;
        self.len_check();
    }

    pub fn clear(&mut self) {
        self.cur = 0;
        self.used = 0;
    }
}

/// Output staging buffer. The window of up to [`INF_HIS_LEN`] bytes
/// preceding `cur` is the established history (the most recent emitted
/// output, zero-padded before any output exists); `used` bytes past `cur`
/// are overflow queued for delivery to the caller.
pub(crate) struct FifoOut {
    pub buf: AlignedBuf,
    pub cur: usize,
    pub used: usize,
}

impl FifoOut {
    /// `len` must be at least `2 * INF_HIS_LEN`; the cursor starts one full
    /// history length in so there is always room behind it.
    pub fn new(len: usize, align: usize) -> Option<FifoOut> {
        debug_assert!(len >= 2 * INF_HIS_LEN);
        Some(FifoOut {
            buf: AlignedBuf::zeroed(len, align)?,
            cur: INF_HIS_LEN,
            used: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len
    }

    pub fn reset(&mut self) {
        self.cur = INF_HIS_LEN;
        self.used = 0;
    }

    /// Compaction: keep the trailing history plus any queued overflow,
    /// slide them to the buffer start, and park the cursor one history
    /// length in.
    pub fn len_check(&mut self) {
        if self.cur > self.len() / 2 {
            self.buf
                .copy_within(self.cur - INF_HIS_LEN..self.cur + self.used, 0);
            self.cur = INF_HIS_LEN;
        }
    }

    /// Delivers queued overflow into `out`, advancing the cursor so the
    /// delivered bytes become history.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.used.min(out.len());
        if n > 0 {
            out[..n].copy_from_slice(&self.buf[self.cur..self.cur + n]);
            self.used -= n;
            self.cur += n;
            self.len_check();
        }
        n
    }

    /// Splits the buffer at the cursor into the trailing `hist_len` bytes of
    /// history and the writable overflow tail. Only valid while no overflow
    /// is queued.
    pub fn split_for_job(&mut self, hist_len: usize) -> (&[u8], &mut [u8]) {
        debug_assert_eq!(self.used, 0);
        debug_assert!(hist_len <= self.cur);
        let cur = self.cur;
        let (head, tail) = self.buf.split_at_mut(cur);
        (&head[cur - hist_len..], tail)
    }

    /// Appends freshly emitted caller-visible output as new history.
    pub fn absorb_history(&mut self, src: &[u8]) {
        let at = self.cur;
        self.buf[at..at + src.len()].copy_from_slice(src);
        self.cur += src.len();
        self.len_check();
    }

    /// Overwrites the tail of the window just below the cursor.
    pub fn patch_history_tail(&mut self, src: &[u8]) {
        let at = self.cur - src.len();
        self.buf[at..self.cur].copy_from_slice(src);
    }

    /// Moves the `len` bytes just below the cursor down by `by`, making room
    /// to patch newer output in above them.
    pub fn shift_window_back(&mut self, len: usize, by: usize) {
        if len > 0 {
            self.buf
                .copy_within(self.cur - len..self.cur, self.cur - by - len);
        }
    }

    /// Overwrites the window region `[cur - below, cur - below + src.len())`.
    pub fn patch_history_at(&mut self, below: usize, src: &[u8]) {
        let at = self.cur - below;
        self.buf[at..at + src.len()].copy_from_slice(src);
    }

    /// Installs the trailing 32 KiB of a caller-supplied dictionary as the
    /// history window.
    pub fn prime_history(&mut self, dict: &[u8]) {
        let n = dict.len().min(INF_HIS_LEN);
        let at = self.cur - n;
        self.buf[at..self.cur].copy_from_slice(&dict[dict.len() - n..]);
    }
}
