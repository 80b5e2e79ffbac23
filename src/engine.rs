//! The accelerator-driven inflate engine.
//!
//! One `decompress` call runs the loop: deliver queued overflow to the
//! caller, stage small inputs, build a scatter/gather job over
//! {history, staged input, caller input} → {caller output, overflow tail},
//! submit it with fault/space retries, interpret the suspend state the
//! device reports, and splice the produced output between the caller's
//! buffer and the history window. The loop exits when one side of the
//! caller's window is exhausted or the final block has been delivered.

use log::{error, trace, warn};

use crate::config::Config;
use crate::fifo::{FifoIn, FifoOut};
use crate::header::{GzHeader, HeaderParser, InfState, Parse, Wrap};
use crate::mem::{DecompressError, FlushDecompress, Status};
use crate::nx::{self, Accelerator, CompletionCode, CrbCpb, FunctionCode, SourceList, TargetList};
use crate::{stats, INF_HIS_LEN};

/// Iteration bound declaring a stream stuck; a pathological input must not
/// spin forever.
const LOOP_MAX: u32 = 0xffff;

/// The caller's buffer window for the duration of one call.
struct Io<'a> {
    input: &'a [u8],
    in_pos: usize,
    output: &'a mut [u8],
    out_pos: usize,
}

impl Io<'_> {
    fn avail_in(&self) -> usize {
        self.input.len() - self.in_pos
    }

    fn avail_out(&self) -> usize {
        self.output.len() - self.out_pos
    }
}

/// What one submitted job reported back.
struct JobResult {
    cc: CompletionCode,
    sfbt: u8,
    subc: u32,
    spbc: u32,
    tpbc: u32,
    /// Caller output capacity at submission; output beyond it overflowed
    /// into the fifo tail.
    len_next_out: usize,
}

pub(crate) struct InflateStream {
    dev: Box<dyn Accelerator>,
    cfg: Config,
    wrap: Wrap,
    #[allow(dead_code)]
    window_bits: u8,
    parser: HeaderParser,
    gzhead: GzHeader,
    havedict: bool,
    total_in: u64,
    total_out: u64,
    adler: u32,
    crc32: u32,
    adler32: u32,
    fifo_in: Option<FifoIn>,
    fifo_out: Option<FifoOut>,
    resuming: bool,
    history_len: usize,
    is_final: bool,
    last_comp_ratio: u64,
    cmd: Box<CrbCpb>,
    msg: Option<&'static str>,
}

impl InflateStream {
    pub fn new(
        dev: Box<dyn Accelerator>,
        wrap: Wrap,
        window_bits: u8,
        cfg: Config,
    ) -> InflateStream {
        stats::with(|s| s.init += 1);
        InflateStream {
            dev,
            parser: HeaderParser::new(wrap, &cfg),
            cfg,
            wrap,
            window_bits,
            gzhead: GzHeader::default(),
            havedict: false,
            total_in: 0,
            total_out: 0,
            adler: initial_adler(wrap),
            crc32: 0,
            adler32: 1,
            fifo_in: None,
            fifo_out: None,
            resuming: false,
            history_len: 0,
            is_final: false,
            last_comp_ratio: 100,
            cmd: Box::new(CrbCpb::default()),
            msg: None,
        }
    }

    pub fn reset(&mut self) {
        self.parser.reset(self.wrap);
        self.gzhead.reset(0);
        self.havedict = false;
        self.total_in = 0;
        self.total_out = 0;
        self.adler = initial_adler(self.wrap);
        self.crc32 = 0;
        self.adler32 = 1;
        if let Some(fifo) = self.fifo_in.as_mut() {
            fifo.clear();
        }
        if let Some(fifo) = self.fifo_out.as_mut() {
            fifo.reset();
        }
        self.resuming = false;
        self.history_len = 0;
        self.is_final = false;
        self.last_comp_ratio = 100;
        *self.cmd = CrbCpb::default();
        self.msg = None;
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn adler(&self) -> u32 {
        self.adler
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn gzip_header(&self) -> Option<&GzHeader> {
        if self.gzhead.done == 1 {
            Some(&self.gzhead)
        } else {
            None
        }
    }

    /// Supplies the preset dictionary announced by a zlib FDICT header.
    pub fn set_dictionary(&mut self, dict: &[u8]) -> Result<(), DecompressError> {
        if self.parser.state != InfState::ZlibDict {
            return Err(DecompressError::stream("dictionary not requested"));
        }
        let mut check = adler32::RollingAdler32::new();
        check.update_buffer(dict);
        if check.hash() != self.parser.dictid() {
            return Err(DecompressError::data("incorrect dictionary"));
        }
        if self.fifo_out.is_none() {
            self.fifo_out = Some(
                FifoOut::new(2 * INF_HIS_LEN, self.cfg.page_sz)
                    .ok_or_else(DecompressError::mem)?,
            );
        }
        let fifo = self.fifo_out.as_mut().unwrap();
        fifo.prime_history(dict);
        self.history_len = dict.len().min(INF_HIS_LEN);
        self.havedict = true;
        Ok(())
    }

    pub fn inflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        flush: FlushDecompress,
    ) -> Result<Status, DecompressError> {
        if self.parser.state == InfState::DataError {
            return Err(DecompressError::data(self.msg.unwrap_or("data error")));
        }

        stats::with(|s| {
            s.inflate += 1;
            s.inflate_len += input.len() as u64;
            s.inflate_avail_in[stats::size_slot(input.len())] += 1;
            s.inflate_avail_out[stats::size_slot(output.len())] += 1;
        });

        // The overflow buffer is sized off the first call's input: roughly
        // 40% of it on top of two history windows.
        if self.fifo_out.is_none() {
            let len = 2 * INF_HIS_LEN + input.len() * 40 / 100;
            self.fifo_out =
                Some(FifoOut::new(len, self.cfg.page_sz).ok_or_else(DecompressError::mem)?);
        }

        let mut io = Io {
            input,
            in_pos: 0,
            output,
            out_pos: 0,
        };

        while self.parser.state != InfState::Inflate {
            let before = io.in_pos;
            let outcome = self.parser.parse(
                io.input,
                &mut io.in_pos,
                self.wrap,
                self.havedict,
                &mut self.gzhead,
            );
            self.total_in += (io.in_pos - before) as u64;
            match outcome {
                Parse::Enter => {
                    self.crc32 = 0;
                    self.adler32 = 1;
                    self.adler = match self.parser.kind() {
                        Wrap::Gzip => 0,
                        Wrap::Zlib => 1,
                        _ => self.adler,
                    };
                }
                Parse::MoreInput => return Ok(Status::Ok),
                Parse::NeedDict(id) => {
                    self.adler = id;
                    return Err(DecompressError::need_dict(id));
                }
                Parse::Bad(msg) => {
                    self.msg = Some(msg);
                    return Err(DecompressError::data(msg));
                }
            }
        }

        self.inflate_body(&mut io, flush)
    }

    fn inflate_body(
        &mut self,
        io: &mut Io<'_>,
        flush: FlushDecompress,
    ) -> Result<Status, DecompressError> {
        // a finished and fully drained stream stays finished
        if self.is_final && self.used_in() == 0 && self.used_out() == 0 {
            return Ok(Status::StreamEnd);
        }
        if flush == FlushDecompress::Finish
            && io.avail_in() == 0
            && self.used_in() == 0
            && self.used_out() == 0
        {
            return Ok(Status::StreamEnd);
        }

        let mut loop_cnt: u32 = 0;
        let mut space_retries: u32 = 0;

        loop {
            loop_cnt += 1;
            if loop_cnt >= LOOP_MAX {
                error!("cannot make progress; giving up after {loop_cnt} iterations");
                return Ok(Status::StreamEnd);
            }

            // Deliver queued overflow before anything else; a new job may
            // not start while output is still staged.
            if self.used_out() > 0 {
                let fifo = self.fifo_out.as_mut().unwrap();
                let n = fifo.drain_into(&mut io.output[io.out_pos..]);
                io.out_pos += n;
                self.total_out += n as u64;
                if self.used_out() > 0 && io.avail_out() == 0 {
                    return Ok(Status::Ok);
                }
                if self.is_final && self.used_in() == 0 {
                    return Ok(Status::StreamEnd);
                }
            }
            debug_assert_eq!(self.used_out(), 0);

            if io.avail_out() == 0 || (io.avail_in() == 0 && self.used_in() == 0) {
                // no forward progress is possible in at least one direction
                if io.in_pos == 0 && io.out_pos == 0 {
                    return Ok(Status::BufError);
                }
                return Ok(Status::Ok);
            }

            // Small trailing user buffers are concatenated across calls;
            // the accelerator has non-trivial per-job overhead.
            if io.avail_in() > 0
                && io.avail_in() < self.cfg.soft_copy_threshold
                && io.avail_out() > 0
            {
                if self.fifo_in.is_none() {
                    let len = self.cfg.soft_copy_threshold * 2;
                    self.fifo_in =
                        Some(FifoIn::new(len, self.cfg.page_sz).ok_or_else(DecompressError::mem)?);
                }
                let fifo = self.fifo_in.as_mut().unwrap();
                let n = fifo.stage(&io.input[io.in_pos..]);
                io.in_pos += n;
                self.total_in += n as u64;
            }

            let res = self.run_job(io, &mut space_retries)?;
            let source_sz = self.apply_resume(&res)?;

            // Consumed bytes come out of the staged fifo first, then the
            // caller's buffer.
            let used_in = self.used_in();
            if source_sz > used_in {
                io.in_pos += source_sz - used_in;
                self.total_in += (source_sz - used_in) as u64;
                if let Some(fifo) = self.fifo_in.as_mut() {
                    fifo.clear();
                }
            } else if source_sz > 0 {
                self.fifo_in.as_mut().unwrap().consume(source_sz);
            }

            self.splice(io, &res);

            self.history_len = (self.total_out as usize + self.used_out()).min(self.cfg.window_max);
            self.last_comp_ratio =
                (1000 * (source_sz as u64 + 1) / (u64::from(res.tpbc) + 1)).clamp(1, 1000);
            self.resuming = true;
            self.crc32 = self.cmd.out_crc;
            self.adler32 = self.cmd.out_adler;
            self.adler = match self.parser.kind() {
                Wrap::Gzip => self.crc32,
                _ => self.adler32,
            };

            if self.is_final || res.cc == CompletionCode::Ok {
                self.is_final = true;
                // staged bytes past the final block were never decoded;
                // they drop out of the consumed count
                self.total_in = self.total_in.saturating_sub(self.used_in() as u64);
                if let Some(fifo) = self.fifo_in.as_mut() {
                    fifo.clear();
                }
                if self.used_out() == 0 {
                    return Ok(Status::StreamEnd);
                }
                continue;
            }

            if io.avail_in() > 0 && io.avail_out() > 0 {
                continue;
            }
            if self.used_in() > 1 && io.avail_out() > 0 && space_retries > 0 {
                continue;
            }
            if flush == FlushDecompress::Finish && io.avail_in() == 0 {
                return Ok(Status::StreamEnd);
            }
            return Ok(Status::Ok);
        }
    }

    /// Builds one job over the current buffers and submits it, retrying
    /// locally on translation faults and target-space overflows.
    fn run_job(
        &mut self,
        io: &mut Io<'_>,
        space_retries: &mut u32,
    ) -> Result<JobResult, DecompressError> {
        let cfg = self.cfg;
        let cmd = &mut *self.cmd;

        if self.resuming {
            cmd.fc = FunctionCode::DecompressResume;
            // checksums of the previous job seed the resumed one
            cmd.in_crc = cmd.out_crc;
            cmd.in_adler = cmd.out_adler;
        } else {
            cmd.fc = FunctionCode::Decompress;
            cmd.in_subc = 0;
            cmd.in_sfbt = 0;
            cmd.in_rembytecnt = 0;
            cmd.in_dhtlen = 0;
            cmd.in_crc = 0;
            cmd.in_adler = 1;
            cmd.out_crc = 0;
            cmd.out_adler = 1;
            self.last_comp_ratio = 100;
        }
        // The device counts history in 128-bit units; pad up to the next
        // quadword. The extra leading bytes are older output (or zeros) and
        // are harmless as dictionary.
        self.history_len = (self.history_len + 15) & !15;
        cmd.in_histlen = (self.history_len / 16) as u32;
        let history_len = self.history_len;

        let fifo_out = self.fifo_out.as_mut().unwrap();
        fifo_out.len_check();
        let cur_out = fifo_out.cur;
        let len_out = fifo_out.len();
        let (history, tail) = fifo_out.split_for_job(history_len);

        let mut src = SourceList::new();
        src.append(history);
        if let Some(fifo) = self.fifo_in.as_ref() {
            src.append(fifo.pending());
        }
        src.append(&io.input[io.in_pos..]);
        let new_pending = src.physical() - history_len;
        debug_assert!(new_pending > 0);

        let len_next_out = io.avail_out();
        let target_cap = len_next_out + tail.len();

        // Advertise only as much source as the measured compression ratio
        // suggests the target can absorb; oversized jobs waste device
        // cycles on target-space retries.
        let budget = (target_cap * self.last_comp_ratio as usize / 1000).clamp(1, cfg.per_job_len);
        let mut declared = history_len + new_pending.min(budget);

        let mut dst = TargetList::new();
        dst.append(&mut io.output[io.out_pos..]);
        dst.append(tail);

        trace!(
            "job: len_next_out {} len_out {} cur_out {} source {} of {} history {} resuming {}",
            len_next_out,
            len_out,
            cur_out,
            declared,
            history_len + new_pending,
            history_len,
            self.resuming,
        );

        let mut pgfault_retries = cfg.retry_max;
        loop {
            src.set_declared(declared);

            // The kernel does not fault NX pages in; touch them ahead of
            // the submission.
            for seg in src.segments() {
                nx::touch_pages(seg, cfg.page_sz);
            }
            for seg in dst.segments_mut().iter_mut() {
                nx::touch_pages_mut(seg, cfg.page_sz);
            }

            let cc = self.dev.submit(&src, &mut dst, cmd);
            stats::with(|s| s.jobs += 1);

            match cc {
                CompletionCode::Translation => {
                    stats::with(|s| s.translation_retries += 1);
                    warn!(
                        "translation fault, retries left {}, fsaddr {:#x}, source {}",
                        pgfault_retries, cmd.csb.fsaddr, declared
                    );
                    if pgfault_retries == cfg.retry_max {
                        // first retry keeps the exact sizes
                        pgfault_retries -= 1;
                    } else if pgfault_retries > 0 {
                        // still faulting; assume memory pressure and offer
                        // fewer source pages
                        if declared > cfg.page_sz {
                            declared = (declared / 2).max(cfg.page_sz).max(history_len + 1);
                        }
                        pgfault_retries -= 1;
                    } else {
                        error!("cannot make progress; too many translation faults");
                        return Err(DecompressError::device("too many page faults", cc));
                    }
                }

                CompletionCode::TargetSpace => {
                    // halve the new input, leaving history intact; byte
                    // counts are not valid on this completion
                    declared = history_len + (declared - history_len + 2) / 2;
                    stats::with(|s| s.target_space_retries += 1);
                    *space_retries += 1;
                    warn!(
                        "target space exhausted; retrying with source {} history {}",
                        declared, history_len
                    );
                }

                CompletionCode::DataLength => {
                    if cmd.csb.is_termination() || !cmd.csb.is_partial_completion() {
                        error!("invalid completion extension {:#05b}", cmd.csb.ce);
                        return Err(DecompressError::device("history length error", cc));
                    }
                    stats::with(|s| s.partial_completions += 1);
                    debug_assert!(cmd.csb.tpbc as usize <= target_cap);
                    return Ok(JobResult {
                        cc,
                        sfbt: cmd.out_sfbt,
                        subc: u32::from(cmd.out_subc),
                        spbc: cmd.out_spbc,
                        tpbc: cmd.csb.tpbc,
                        len_next_out,
                    });
                }

                CompletionCode::Ok => {
                    return Ok(JobResult {
                        cc,
                        sfbt: 0,
                        subc: 0,
                        spbc: cmd.out_spbc,
                        tpbc: cmd.csb.tpbc,
                        len_next_out,
                    });
                }

                CompletionCode::Other(code) => {
                    error!(
                        "unexpected completion code {:#x}; ce {:#05b} fsaddr {:#x}",
                        code, cmd.csb.ce, cmd.csb.fsaddr
                    );
                    return Err(DecompressError::device("unrecognized completion code", cc));
                }
            }
        }
    }

    /// Interprets the source-final-block-type the device reported and
    /// prepares the control block for the next job. Returns the number of
    /// compressed bytes actually consumed.
    fn apply_resume(&mut self, res: &JobResult) -> Result<usize, DecompressError> {
        let cmd = &mut *self.cmd;
        debug_assert!(res.spbc as usize >= self.history_len);
        let mut source_sz = (res.spbc as usize).saturating_sub(self.history_len);

        if res.cc == CompletionCode::Ok {
            // the device processed everything it was given; no suspend
            // state to carry
            return Ok(source_sz);
        }

        match res.sfbt {
            // final EOB processed; anything past it is container trailer
            0b0000 => {
                source_sz -= (res.subc / 8) as usize;
                self.is_final = true;
            }

            // suspended inside a stored block: the remaining byte count
            // rides along
            0b1000 | 0b1001 => {
                source_sz -= ((res.subc + 7) / 8) as usize;
                cmd.in_subc = (res.subc % 8) as u16;
                cmd.in_sfbt = res.sfbt;
                cmd.in_rembytecnt = cmd.out_rembytecnt;
            }

            // suspended inside a fixed-Huffman block
            0b1010 | 0b1011 => {
                source_sz -= ((res.subc + 7) / 8) as usize;
                cmd.in_subc = (res.subc % 8) as u16;
                cmd.in_sfbt = res.sfbt;
            }

            // suspended inside a dynamic-Huffman block: the decode table
            // must be handed back
            0b1100 | 0b1101 => {
                source_sz -= ((res.subc + 7) / 8) as usize;
                cmd.in_subc = (res.subc % 8) as u16;
                cmd.in_sfbt = res.sfbt;
                let dhtlen = cmd.out_dhtlen;
                debug_assert!(dhtlen >= 42);
                cmd.in_dhtlen = dhtlen;
                let quads = (dhtlen as usize + 127) / 128;
                let nbytes = (quads * 16).min(cmd.in_dht.len());
                cmd.in_dht[..nbytes].copy_from_slice(&cmd.out_dht[..nbytes]);
            }

            // suspended inside a block header, or exactly at a non-final EOB
            0b1110 | 0b1111 => {
                source_sz -= ((res.subc + 7) / 8) as usize;
                cmd.in_subc = (res.subc % 8) as u16;
                cmd.in_sfbt = res.sfbt;
            }

            other => {
                error!("unexpected source final block type {other:#06b}");
                return Err(DecompressError::device(
                    "unexpected source final block type",
                    res.cc,
                ));
            }
        }
        Ok(source_sz)
    }

    /// Splits the job's output between the caller's buffer and the overflow
    /// tail, and re-establishes the history window behind the cursor.
    fn splice(&mut self, io: &mut Io<'_>, res: &JobResult) {
        let tpbc = res.tpbc as usize;
        let len_next_out = res.len_next_out;
        let fifo = self.fifo_out.as_mut().unwrap();

        if tpbc <= len_next_out {
            // everything landed in the caller's buffer; its tail becomes
            // the next job's history
            let need = INF_HIS_LEN.min(tpbc);
            let start = io.out_pos + tpbc - need;
            fifo.absorb_history(&io.output[start..start + need]);
            io.out_pos += tpbc;
            self.total_out += tpbc as u64;
            return;
        }

        let overflow = tpbc - len_next_out;
        if overflow < INF_HIS_LEN {
            // the window must end with the caller-visible bytes; patch
            // them in below the cursor, shifting older history down when
            // the job produced less than a full window
            if len_next_out + overflow > INF_HIS_LEN {
                let n = INF_HIS_LEN - overflow;
                let start = io.out_pos + len_next_out - n;
                fifo.patch_history_tail(&io.output[start..start + n]);
            } else {
                let keep = INF_HIS_LEN - (len_next_out + overflow);
                fifo.shift_window_back(keep, len_next_out);
                fifo.patch_history_at(len_next_out, &io.output[io.out_pos..io.out_pos + len_next_out]);
            }
        }
        // overflow of a full window or more already holds the history by
        // itself, queued past the cursor
        fifo.used += overflow;
        io.out_pos += len_next_out;
        self.total_out += len_next_out as u64;
    }

    fn used_in(&self) -> usize {
        self.fifo_in.as_ref().map_or(0, |f| f.used)
    }

    fn used_out(&self) -> usize {
        self.fifo_out.as_ref().map_or(0, |f| f.used)
    }
}

fn initial_adler(wrap: Wrap) -> u32 {
    match wrap {
        Wrap::Raw => 0,
        _ => 1,
    }
}
