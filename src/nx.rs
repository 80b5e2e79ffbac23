//! Types and traits at the accelerator boundary.
//!
//! The inflate core drives a DEFLATE-capable offload engine through the
//! interfaces in this module but does not define the engine itself. A
//! platform integration implements [`Accelerator`] on top of whatever
//! submission primitive the hardware exposes; tests implement it with a
//! software model. Everything the core and a device need to exchange travels
//! through three values per job: an ordered source descriptor list, an
//! ordered target descriptor list, and the persistent [`CrbCpb`] command
//! block that carries resume state from one job to the next.

/// Maximum size in bytes of a dynamic-Huffman table carried between jobs.
pub const DHT_MAX: usize = 288;

/// Completion-extension bit indicating a valid partial completion: the
/// source/target byte counts and the suspend fields of the [`CrbCpb`] are
/// meaningful.
pub const CSB_CE_PARTIAL: u8 = 0b100;

/// Completion-extension bit indicating the job terminated without usable
/// suspend state.
pub const CSB_CE_TERMINATION: u8 = 0b010;

/// Function code selecting what a submitted job does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FunctionCode {
    /// Decompress from the start of a DEFLATE stream.
    Decompress,
    /// Decompress continuing a suspended stream; the `in_*` suspend fields
    /// and the leading history descriptor describe where to pick up.
    DecompressResume,
}

impl Default for FunctionCode {
    fn default() -> FunctionCode {
        FunctionCode::Decompress
    }
}

/// Job completion codes a device may return.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    /// Every declared source byte was processed.
    Ok,
    /// The declared source ended before the DEFLATE stream did, or trailing
    /// bytes remain after the final block. The CSB extension bits must
    /// indicate a partial completion for the suspend fields to be valid.
    DataLength,
    /// The target descriptor list was too small for the produced output.
    /// No counts are valid; the job must be resubmitted.
    TargetSpace,
    /// A source or target page was not resident. `fsaddr` holds the faulting
    /// address; the job must be resubmitted after faulting pages in.
    Translation,
    /// Any other device status, carried verbatim.
    Other(u32),
}

/// Status block written by the device when a job completes.
#[derive(Copy, Clone, Debug, Default)]
pub struct Csb {
    /// Completion-extension bits, see [`CSB_CE_PARTIAL`] and
    /// [`CSB_CE_TERMINATION`].
    pub ce: u8,
    /// Target processed byte count: bytes written across the target
    /// descriptor list.
    pub tpbc: u32,
    /// Faulting address for [`CompletionCode::Translation`].
    pub fsaddr: u64,
}

impl Csb {
    /// Whether the job suspended with valid counts and resume fields.
    pub fn is_partial_completion(&self) -> bool {
        self.ce & CSB_CE_PARTIAL != 0
    }

    /// Whether the job terminated without usable suspend state.
    pub fn is_termination(&self) -> bool {
        self.ce & CSB_CE_TERMINATION != 0
    }
}

/// Command/parameter block, persistent across the jobs of one stream.
///
/// The `in_*` fields are written by the core before submission; the `out_*`
/// fields are written by the device on completion. Resuming a suspended
/// stream consists of copying selected `out_*` values of the previous job
/// into the `in_*` fields of the next (see the resume controller in the
/// inflate engine).
#[derive(Clone)]
pub struct CrbCpb {
    /// Operation to perform.
    pub fc: FunctionCode,
    /// Initial CRC-32 for checksum continuation.
    pub in_crc: u32,
    /// Initial Adler-32 for checksum continuation.
    pub in_adler: u32,
    /// Length of the leading history descriptor in 16-byte quadwords.
    pub in_histlen: u32,
    /// Bits of the first non-history source byte still to be processed;
    /// zero means all eight.
    pub in_subc: u16,
    /// Source final block type of the previous job, identifying the region
    /// of the bitstream in which decoding suspended.
    pub in_sfbt: u8,
    /// Bytes remaining of a stored block suspended mid-copy.
    pub in_rembytecnt: u16,
    /// Length in bits of the dynamic-Huffman table in `in_dht`.
    pub in_dhtlen: u16,
    /// Dynamic-Huffman table of a suspended dynamic block.
    pub in_dht: [u8; DHT_MAX],
    /// Running CRC-32 over all output produced so far.
    pub out_crc: u32,
    /// Running Adler-32 over all output produced so far.
    pub out_adler: u32,
    /// Where decoding stopped, see [`CrbCpb::in_sfbt`].
    pub out_sfbt: u8,
    /// Bits of the last touched source byte left unprocessed.
    pub out_subc: u16,
    /// Source processed byte count, history included.
    pub out_spbc: u32,
    /// Bytes remaining of a stored block at suspension.
    pub out_rembytecnt: u16,
    /// Length in bits of `out_dht`.
    pub out_dhtlen: u16,
    /// Dynamic-Huffman table in effect at suspension.
    pub out_dht: [u8; DHT_MAX],
    /// Completion status.
    pub csb: Csb,
}

impl Default for CrbCpb {
    fn default() -> CrbCpb {
        CrbCpb {
            fc: FunctionCode::Decompress,
            in_crc: 0,
            in_adler: 1,
            in_histlen: 0,
            in_subc: 0,
            in_sfbt: 0,
            in_rembytecnt: 0,
            in_dhtlen: 0,
            in_dht: [0; DHT_MAX],
            out_crc: 0,
            out_adler: 1,
            out_sfbt: 0,
            out_subc: 0,
            out_spbc: 0,
            out_rembytecnt: 0,
            out_dhtlen: 0,
            out_dht: [0; DHT_MAX],
            csb: Csb::default(),
        }
    }
}

impl std::fmt::Debug for CrbCpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrbCpb")
            .field("fc", &self.fc)
            .field("in_histlen", &self.in_histlen)
            .field("in_subc", &self.in_subc)
            .field("in_sfbt", &self.in_sfbt)
            .field("out_sfbt", &self.out_sfbt)
            .field("out_subc", &self.out_subc)
            .field("out_spbc", &self.out_spbc)
            .field("csb", &self.csb)
            .finish_non_exhaustive()
    }
}

/// Ordered scatter/gather list of read-only source segments.
///
/// The declared byte count starts equal to the physical length of the
/// appended segments but may be lowered by the core to throttle a job; a
/// device must not read past it.
#[derive(Default)]
pub struct SourceList<'a> {
    segments: Vec<&'a [u8]>,
    declared: usize,
}

impl<'a> SourceList<'a> {
    /// Creates an empty list.
    pub fn new() -> SourceList<'a> {
        SourceList {
            segments: Vec::with_capacity(3),
            declared: 0,
        }
    }

    /// Appends a segment; empty segments are dropped.
    pub fn append(&mut self, segment: &'a [u8]) {
        if !segment.is_empty() {
            self.declared += segment.len();
            self.segments.push(segment);
        }
    }

    /// Total length of the appended segments.
    pub fn physical(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// The advertised source byte count.
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Lowers the advertised source byte count.
    pub fn set_declared(&mut self, declared: usize) {
        debug_assert!(declared <= self.physical());
        self.declared = declared;
    }

    /// The segments in submission order.
    pub fn segments(&self) -> &[&'a [u8]] {
        &self.segments
    }

    /// Byte at `idx` within the declared range, walking segments in order.
    pub fn byte_at(&self, mut idx: usize) -> Option<u8> {
        if idx >= self.declared {
            return None;
        }
        for seg in &self.segments {
            if idx < seg.len() {
                return Some(seg[idx]);
            }
            idx -= seg.len();
        }
        None
    }
}

/// Ordered scatter/gather list of writable target segments.
#[derive(Default)]
pub struct TargetList<'a> {
    segments: Vec<&'a mut [u8]>,
}

impl<'a> TargetList<'a> {
    /// Creates an empty list.
    pub fn new() -> TargetList<'a> {
        TargetList {
            segments: Vec::with_capacity(2),
        }
    }

    /// Appends a segment; empty segments are dropped.
    pub fn append(&mut self, segment: &'a mut [u8]) {
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    /// Total writable capacity.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Whether the list has no capacity at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The segments in submission order.
    pub fn segments_mut(&mut self) -> &mut [&'a mut [u8]] {
        &mut self.segments
    }
}

/// A DEFLATE offload engine.
///
/// Submission is synchronous: the call returns once the device has either
/// finished or suspended the job. Jobs belonging to one stream are strictly
/// serialized by the caller, but a single device may be shared by many
/// streams, hence `&self`.
pub trait Accelerator: Send {
    /// Runs one job over `src` into `dst`, reading and updating `cmd`.
    fn submit(
        &self,
        src: &SourceList<'_>,
        dst: &mut TargetList<'_>,
        cmd: &mut CrbCpb,
    ) -> CompletionCode;
}

/// Faults in every page of `buf` ahead of a job submission.
pub fn touch_pages(buf: &[u8], page_sz: usize) {
    let page_sz = page_sz.max(1);
    let mut off = 0;
    while off < buf.len() {
        // Volatile so the read is not optimized away.
        unsafe { std::ptr::read_volatile(buf.as_ptr().add(off)) };
        off += page_sz;
    }
    if let Some(last) = buf.last() {
        unsafe { std::ptr::read_volatile(last) };
    }
}

/// Faults in every page of `buf` for writing ahead of a job submission.
pub fn touch_pages_mut(buf: &mut [u8], page_sz: usize) {
    let page_sz = page_sz.max(1);
    let len = buf.len();
    let mut off = 0;
    while off < len {
        unsafe {
            let p = buf.as_mut_ptr().add(off);
            let v = std::ptr::read_volatile(p);
            std::ptr::write_volatile(p, v);
        }
        off += page_sz;
    }
    if len > 0 {
        unsafe {
            let p = buf.as_mut_ptr().add(len - 1);
            let v = std::ptr::read_volatile(p);
            std::ptr::write_volatile(p, v);
        }
    }
}
