//! Test support: a software model of the DEFLATE offload engine plus
//! reference encoders.
//!
//! `SoftNx` implements the accelerator contract bit-exactly: it decodes RFC
//! 1951 streams over the declared source descriptors, honors the carried
//! history, the partial first byte (`in_subc`), stored-block remainders and
//! dynamic-Huffman tables, and reports suspension exactly the way the
//! inflate engine expects (SFBT/SUBC/SPBC/TPBC and carried checksums).
//! Wrappers inject translation faults and target-space overflows to
//! exercise the retry policy.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use adler32::RollingAdler32;
use nxflate::nx::{
    Accelerator, CompletionCode, CrbCpb, FunctionCode, SourceList, TargetList, CSB_CE_PARTIAL,
    DHT_MAX,
};
use nxflate::{Decompress, DecompressError, FlushDecompress, Status, Wrap};

pub const WINDOW: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// length/distance tables shared by the decoder and the fixed-Huffman encoder

const LEN_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LEN_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12,
    13, 13,
];
const CLEN_ORDER: [usize; 19] = [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

// ---------------------------------------------------------------------------
// bit-level reading over descriptor lists

#[derive(Clone, Copy, Debug)]
enum Stop {
    NeedBits,
    Corrupt,
}

#[derive(Clone, Copy)]
enum Bytes<'a> {
    Ddl { list: &'a SourceList<'a>, base: usize },
    Flat(&'a [u8]),
}

#[derive(Clone)]
struct BitReader<'a> {
    src: Bytes<'a>,
    /// Bit cursor relative to the first byte after `base`.
    pos: usize,
    limit: usize,
}

impl<'a> BitReader<'a> {
    fn over_ddl(list: &'a SourceList<'a>, base: usize) -> BitReader<'a> {
        BitReader {
            src: Bytes::Ddl { list, base },
            pos: 0,
            limit: (list.declared() - base) * 8,
        }
    }

    fn over_flat(bytes: &'a [u8], bit_limit: usize) -> BitReader<'a> {
        BitReader {
            src: Bytes::Flat(bytes),
            pos: 0,
            limit: bit_limit,
        }
    }

    fn byte(&self, idx: usize) -> u8 {
        match self.src {
            Bytes::Ddl { list, base } => list.byte_at(base + idx).unwrap(),
            Bytes::Flat(bytes) => bytes[idx],
        }
    }

    fn bit(&mut self) -> Result<u32, Stop> {
        if self.pos >= self.limit {
            return Err(Stop::NeedBits);
        }
        let b = self.byte(self.pos / 8);
        let v = u32::from(b >> (self.pos % 8)) & 1;
        self.pos += 1;
        Ok(v)
    }

    fn bits(&mut self, n: usize) -> Result<u32, Stop> {
        let mut v = 0;
        for i in 0..n {
            v |= self.bit()? << i;
        }
        Ok(v)
    }

    fn align(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }
}

// ---------------------------------------------------------------------------
// canonical Huffman decoding (bit-by-bit walk over the code-length counts)

struct Huff {
    count: [u16; 16],
    symbol: Vec<u16>,
}

impl Huff {
    fn new(lengths: &[u8]) -> Option<Huff> {
        let mut count = [0u16; 16];
        for &l in lengths {
            if l > 15 {
                return None;
            }
            count[l as usize] += 1;
        }
        count[0] = 0;
        let mut left = 1i32;
        for len in 1..16 {
            left <<= 1;
            left -= i32::from(count[len]);
            if left < 0 {
                return None;
            }
        }
        let mut offs = [0u16; 16];
        for len in 1..15 {
            offs[len + 1] = offs[len] + count[len];
        }
        let total: usize = count.iter().map(|&c| usize::from(c)).sum();
        let mut symbol = vec![0u16; total];
        for (sym, &l) in lengths.iter().enumerate() {
            if l != 0 {
                symbol[usize::from(offs[l as usize])] = sym as u16;
                offs[l as usize] += 1;
            }
        }
        Some(Huff { count, symbol })
    }

    fn decode(&self, br: &mut BitReader<'_>) -> Result<u16, Stop> {
        let mut code = 0i32;
        let mut first = 0i32;
        let mut index = 0i32;
        for len in 1..16 {
            code |= br.bit()? as i32;
            let cnt = i32::from(self.count[len]);
            if code - first < cnt {
                return Ok(self.symbol[(index + (code - first)) as usize]);
            }
            index += cnt;
            first = (first + cnt) << 1;
            code <<= 1;
        }
        Err(Stop::Corrupt)
    }
}

fn fixed_tables() -> (Huff, Huff) {
    let mut lit = [0u8; 288];
    for (i, l) in lit.iter_mut().enumerate() {
        *l = match i {
            0..=143 => 8,
            144..=255 => 9,
            256..=279 => 7,
            _ => 8,
        };
    }
    let dist = [5u8; 30];
    (Huff::new(&lit).unwrap(), Huff::new(&dist).unwrap())
}

fn parse_dynamic_header(br: &mut BitReader<'_>) -> Result<(Huff, Huff), Stop> {
    let hlit = br.bits(5)? as usize + 257;
    let hdist = br.bits(5)? as usize + 1;
    let hclen = br.bits(4)? as usize + 4;
    let mut clen = [0u8; 19];
    for &ord in CLEN_ORDER.iter().take(hclen) {
        clen[ord] = br.bits(3)? as u8;
    }
    let cl_huff = Huff::new(&clen).ok_or(Stop::Corrupt)?;
    let mut lengths = vec![0u8; hlit + hdist];
    let mut i = 0;
    while i < lengths.len() {
        let sym = cl_huff.decode(br)?;
        match sym {
            0..=15 => {
                lengths[i] = sym as u8;
                i += 1;
            }
            16 => {
                if i == 0 {
                    return Err(Stop::Corrupt);
                }
                let prev = lengths[i - 1];
                let rep = 3 + br.bits(2)? as usize;
                if i + rep > lengths.len() {
                    return Err(Stop::Corrupt);
                }
                for _ in 0..rep {
                    lengths[i] = prev;
                    i += 1;
                }
            }
            17 => {
                let rep = 3 + br.bits(3)? as usize;
                if i + rep > lengths.len() {
                    return Err(Stop::Corrupt);
                }
                i += rep;
            }
            18 => {
                let rep = 11 + br.bits(7)? as usize;
                if i + rep > lengths.len() {
                    return Err(Stop::Corrupt);
                }
                i += rep;
            }
            _ => return Err(Stop::Corrupt),
        }
    }
    let lit = Huff::new(&lengths[..hlit]).ok_or(Stop::Corrupt)?;
    let dist = Huff::new(&lengths[hlit..]).ok_or(Stop::Corrupt)?;
    Ok((lit, dist))
}

fn capture_bits(br: &BitReader<'_>, start: usize, end: usize) -> ([u8; DHT_MAX], u16) {
    let mut out = [0u8; DHT_MAX];
    let mut r = br.clone();
    r.pos = start;
    for i in 0..end - start {
        let bit = r.bit().unwrap();
        out[i / 8] |= (bit as u8) << (i % 8);
    }
    (out, (end - start) as u16)
}

// ---------------------------------------------------------------------------
// sequential writing over target descriptor lists

struct Writer<'w, 'a> {
    segs: &'w mut [&'a mut [u8]],
    seg: usize,
    off: usize,
    written: usize,
    cap: usize,
}

impl<'w, 'a> Writer<'w, 'a> {
    fn new(dst: &'w mut TargetList<'a>) -> Writer<'w, 'a> {
        let cap = dst.len();
        Writer {
            segs: dst.segments_mut(),
            seg: 0,
            off: 0,
            written: 0,
            cap,
        }
    }

    fn remaining(&self) -> usize {
        self.cap - self.written
    }

    fn push(&mut self, b: u8) {
        while self.off == self.segs[self.seg].len() {
            self.seg += 1;
            self.off = 0;
        }
        self.segs[self.seg][self.off] = b;
        self.off += 1;
        self.written += 1;
    }
}

// ---------------------------------------------------------------------------
// the software accelerator

enum Region {
    Boundary,
    Stored { rem: usize, bfinal: bool },
    Huff { bfinal: bool, fixed: bool },
}

/// A software DEFLATE engine speaking the accelerator job protocol.
pub struct SoftNx;

impl Accelerator for SoftNx {
    fn submit(
        &self,
        src: &SourceList<'_>,
        dst: &mut TargetList<'_>,
        cmd: &mut CrbCpb,
    ) -> CompletionCode {
        decode_job(src, dst, cmd)
    }
}

fn decode_job(src: &SourceList<'_>, dst: &mut TargetList<'_>, cmd: &mut CrbCpb) -> CompletionCode {
    let hist_len = cmd.in_histlen as usize * 16;
    let declared = src.declared();
    if declared <= hist_len {
        return CompletionCode::Other(0xe0);
    }
    let src_len = declared - hist_len;

    // the window starts as the carried history and grows with every
    // emitted byte
    let mut window: Vec<u8> = (0..hist_len).map(|i| src.byte_at(i).unwrap()).collect();
    let mut br = BitReader::over_ddl(src, hist_len);

    let resuming = cmd.fc == FunctionCode::DecompressResume;
    if resuming && cmd.in_subc % 8 != 0 {
        // low bits of the first byte were processed by the previous job
        br.pos = (8 - cmd.in_subc as usize % 8) % 8;
    }

    let mut out = Writer::new(dst);
    let mut dht: Option<([u8; DHT_MAX], u16)> = None;
    let mut tables: Option<(Huff, Huff)> = None;

    let mut region = if !resuming {
        Region::Boundary
    } else {
        match cmd.in_sfbt {
            0b0000 | 0b1110 | 0b1111 => Region::Boundary,
            s @ (0b1000 | 0b1001) => Region::Stored {
                rem: cmd.in_rembytecnt as usize,
                bfinal: s & 1 == 1,
            },
            s @ (0b1010 | 0b1011) => {
                tables = Some(fixed_tables());
                Region::Huff {
                    bfinal: s & 1 == 1,
                    fixed: true,
                }
            }
            s @ (0b1100 | 0b1101) => {
                let blob = cmd.in_dht;
                let mut fr = BitReader::over_flat(&blob, cmd.in_dhtlen as usize);
                match parse_dynamic_header(&mut fr) {
                    Ok(t) => tables = Some(t),
                    Err(_) => return CompletionCode::Other(0xe1),
                }
                dht = Some((cmd.in_dht, cmd.in_dhtlen));
                Region::Huff {
                    bfinal: s & 1 == 1,
                    fixed: false,
                }
            }
            _ => return CompletionCode::Other(0xe2),
        }
    };

    // Decoding is atomic per unit: a block header, one symbol (with its
    // extra bits and distance), or one stored byte. On a source shortfall
    // the cursor rolls back to the last committed unit and the job
    // suspends there.
    enum Outcome {
        Suspend(u8, u16), // sfbt, rembytecnt
        Final,
        Corrupt,
    }

    let outcome = loop {
        match region {
            Region::Boundary => {
                let save = br.pos;
                let bf = match br.bit() {
                    Ok(v) => v,
                    Err(_) => break Outcome::Suspend(0b1110, 0),
                };
                let boundary_sfbt = if bf == 1 { 0b1111 } else { 0b1110 };
                let btype = match br.bits(2) {
                    Ok(v) => v,
                    Err(_) => {
                        br.pos = save;
                        break Outcome::Suspend(boundary_sfbt, 0);
                    }
                };
                match btype {
                    0 => {
                        let mut tr = br.clone();
                        tr.align();
                        let hdr =
                            (|| -> Result<(u32, u32), Stop> { Ok((tr.bits(16)?, tr.bits(16)?)) })();
                        match hdr {
                            Ok((len, nlen)) => {
                                if len != !nlen & 0xffff {
                                    break Outcome::Corrupt;
                                }
                                br = tr;
                                region = Region::Stored {
                                    rem: len as usize,
                                    bfinal: bf == 1,
                                };
                            }
                            Err(Stop::NeedBits) => {
                                br.pos = save;
                                break Outcome::Suspend(boundary_sfbt, 0);
                            }
                            Err(Stop::Corrupt) => break Outcome::Corrupt,
                        }
                    }
                    1 => {
                        tables = Some(fixed_tables());
                        dht = None;
                        region = Region::Huff {
                            bfinal: bf == 1,
                            fixed: true,
                        };
                    }
                    2 => {
                        let mut tr = br.clone();
                        let hstart = tr.pos;
                        match parse_dynamic_header(&mut tr) {
                            Ok(t) => {
                                dht = Some(capture_bits(&br, hstart, tr.pos));
                                tables = Some(t);
                                br = tr;
                                region = Region::Huff {
                                    bfinal: bf == 1,
                                    fixed: false,
                                };
                            }
                            Err(Stop::NeedBits) => {
                                br.pos = save;
                                break Outcome::Suspend(boundary_sfbt, 0);
                            }
                            Err(Stop::Corrupt) => break Outcome::Corrupt,
                        }
                    }
                    _ => break Outcome::Corrupt,
                }
            }

            Region::Stored { ref mut rem, bfinal } => {
                if *rem == 0 {
                    if bfinal {
                        break Outcome::Final;
                    }
                    region = Region::Boundary;
                } else {
                    let save = br.pos;
                    match br.bits(8) {
                        Ok(b) => {
                            if out.remaining() == 0 {
                                return CompletionCode::TargetSpace;
                            }
                            out.push(b as u8);
                            window.push(b as u8);
                            *rem -= 1;
                        }
                        Err(_) => {
                            br.pos = save;
                            let sfbt = 0b1000 | u8::from(bfinal);
                            break Outcome::Suspend(sfbt, *rem as u16);
                        }
                    }
                }
            }

            Region::Huff { bfinal, fixed } => {
                let sfbt = if fixed { 0b1010 } else { 0b1100 } | u8::from(bfinal);
                let (lit, dist) = tables.as_ref().unwrap();
                let save = br.pos;
                let sym = match lit.decode(&mut br) {
                    Ok(s) => s,
                    Err(Stop::NeedBits) => {
                        br.pos = save;
                        break Outcome::Suspend(sfbt, 0);
                    }
                    Err(Stop::Corrupt) => break Outcome::Corrupt,
                };
                if sym < 256 {
                    if out.remaining() == 0 {
                        return CompletionCode::TargetSpace;
                    }
                    out.push(sym as u8);
                    window.push(sym as u8);
                } else if sym == 256 {
                    if bfinal {
                        break Outcome::Final;
                    }
                    region = Region::Boundary;
                } else {
                    let pair = (|| -> Result<(usize, usize), Stop> {
                        let li = sym as usize - 257;
                        if li >= 29 {
                            return Err(Stop::Corrupt);
                        }
                        let len =
                            LEN_BASE[li] as usize + br.bits(LEN_EXTRA[li] as usize)? as usize;
                        let ds = dist.decode(&mut br)? as usize;
                        if ds >= 30 {
                            return Err(Stop::Corrupt);
                        }
                        let d = DIST_BASE[ds] as usize + br.bits(DIST_EXTRA[ds] as usize)? as usize;
                        Ok((len, d))
                    })();
                    match pair {
                        Ok((len, d)) => {
                            if d > window.len() {
                                break Outcome::Corrupt;
                            }
                            if out.remaining() < len {
                                return CompletionCode::TargetSpace;
                            }
                            for _ in 0..len {
                                let b = window[window.len() - d];
                                out.push(b);
                                window.push(b);
                            }
                        }
                        Err(Stop::NeedBits) => {
                            br.pos = save;
                            break Outcome::Suspend(sfbt, 0);
                        }
                        Err(Stop::Corrupt) => break Outcome::Corrupt,
                    }
                }
            }
        }
    };

    // carried checksums cover every byte this job emitted
    let emitted = &window[hist_len..];
    let mut crc = crc32fast::Hasher::new_with_initial(cmd.in_crc);
    crc.update(emitted);
    cmd.out_crc = crc.finalize();
    let mut adler = RollingAdler32::from_value(cmd.in_adler);
    adler.update_buffer(emitted);
    cmd.out_adler = adler.hash();

    let touched = (br.pos + 7) / 8;
    cmd.out_spbc = (hist_len + touched) as u32;
    cmd.out_subc = (touched * 8 - br.pos) as u16;
    cmd.out_rembytecnt = 0;
    cmd.out_dhtlen = 0;
    cmd.csb.tpbc = out.written as u32;
    cmd.csb.fsaddr = 0;
    cmd.csb.ce = CSB_CE_PARTIAL;

    match outcome {
        Outcome::Final => {
            cmd.out_sfbt = 0;
            if touched == src_len {
                CompletionCode::Ok
            } else {
                CompletionCode::DataLength
            }
        }
        Outcome::Suspend(sfbt, rembytecnt) => {
            cmd.out_sfbt = sfbt;
            cmd.out_rembytecnt = rembytecnt;
            if sfbt & 0b1100 == 0b1100 {
                let (blob, bits) = dht.expect("suspended in a dynamic block without a table");
                cmd.out_dht = blob;
                cmd.out_dhtlen = bits;
            }
            CompletionCode::DataLength
        }
        Outcome::Corrupt => CompletionCode::Other(0xee),
    }
}

// ---------------------------------------------------------------------------
// fault injection and instrumentation wrappers

/// A canned device response to splice ahead of the real one.
pub enum Fault {
    Translation,
    TargetSpace,
    Other(u32),
}

/// Returns the planned faults first, then delegates.
pub struct FaultInjector<D> {
    inner: D,
    plan: RefCell<VecDeque<Fault>>,
}

impl<D> FaultInjector<D> {
    pub fn new(inner: D, plan: Vec<Fault>) -> FaultInjector<D> {
        FaultInjector {
            inner,
            plan: RefCell::new(plan.into()),
        }
    }
}

impl<D: Accelerator> Accelerator for FaultInjector<D> {
    fn submit(
        &self,
        src: &SourceList<'_>,
        dst: &mut TargetList<'_>,
        cmd: &mut CrbCpb,
    ) -> CompletionCode {
        if let Some(fault) = self.plan.borrow_mut().pop_front() {
            return match fault {
                Fault::Translation => {
                    cmd.csb.fsaddr = 0xdead_beef;
                    CompletionCode::Translation
                }
                Fault::TargetSpace => CompletionCode::TargetSpace,
                Fault::Other(code) => CompletionCode::Other(code),
            };
        }
        self.inner.submit(src, dst, cmd)
    }
}

/// Shared view into what a [`Counting`] device observed; clone it before
/// boxing the device.
#[derive(Clone, Default)]
pub struct Probe(Arc<Mutex<ProbeInner>>);

#[derive(Default)]
struct ProbeInner {
    jobs: u32,
    declared: Vec<usize>,
    codes: Vec<CompletionCode>,
    sfbts: Vec<u8>,
}

impl Probe {
    pub fn jobs(&self) -> u32 {
        self.0.lock().unwrap().jobs
    }

    pub fn declared(&self) -> Vec<usize> {
        self.0.lock().unwrap().declared.clone()
    }

    pub fn codes(&self) -> Vec<CompletionCode> {
        self.0.lock().unwrap().codes.clone()
    }

    /// The `out_sfbt` of every partial completion, in order.
    pub fn sfbts(&self) -> Vec<u8> {
        self.0.lock().unwrap().sfbts.clone()
    }
}

/// Records submissions, completion codes and suspend states.
pub struct Counting<D> {
    inner: D,
    probe: Probe,
}

impl<D> Counting<D> {
    pub fn new(inner: D) -> (Counting<D>, Probe) {
        let probe = Probe::default();
        (
            Counting {
                inner,
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl<D: Accelerator> Accelerator for Counting<D> {
    fn submit(
        &self,
        src: &SourceList<'_>,
        dst: &mut TargetList<'_>,
        cmd: &mut CrbCpb,
    ) -> CompletionCode {
        let declared = src.declared();
        let cc = self.inner.submit(src, dst, cmd);
        let mut probe = self.probe.0.lock().unwrap();
        probe.jobs += 1;
        probe.declared.push(declared);
        probe.codes.push(cc);
        if cc == CompletionCode::DataLength {
            probe.sfbts.push(cmd.out_sfbt);
        }
        cc
    }
}

// ---------------------------------------------------------------------------
// reference encoders

/// LSB-first bit packer for hand-built DEFLATE streams.
pub struct BitWriter {
    bytes: Vec<u8>,
    cur: u8,
    nbits: u32,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter {
            bytes: Vec::new(),
            cur: 0,
            nbits: 0,
        }
    }

    pub fn put_bits(&mut self, v: u32, n: u32) {
        for i in 0..n {
            self.cur |= (((v >> i) & 1) as u8) << self.nbits;
            self.nbits += 1;
            if self.nbits == 8 {
                self.bytes.push(self.cur);
                self.cur = 0;
                self.nbits = 0;
            }
        }
    }

    /// Huffman codes go on the wire most-significant bit first.
    pub fn put_code(&mut self, code: u32, n: u32) {
        for i in (0..n).rev() {
            self.put_bits(code >> i, 1);
        }
    }

    pub fn align(&mut self) {
        if self.nbits > 0 {
            self.bytes.push(self.cur);
            self.cur = 0;
            self.nbits = 0;
        }
    }

    pub fn put_aligned_bytes(&mut self, data: &[u8]) {
        assert_eq!(self.nbits, 0);
        self.bytes.extend_from_slice(data);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        BitWriter::new()
    }
}

/// Hand encoder emitting fixed-Huffman blocks, with back-reference support
/// so tests can reach into carried history and dictionaries.
pub struct FixedEncoder {
    pub bw: BitWriter,
}

impl FixedEncoder {
    pub fn new() -> FixedEncoder {
        FixedEncoder {
            bw: BitWriter::new(),
        }
    }

    pub fn begin_block(&mut self, bfinal: bool) {
        self.bw.put_bits(u32::from(bfinal), 1);
        self.bw.put_bits(1, 2);
    }

    pub fn literal(&mut self, b: u8) {
        if b < 144 {
            self.bw.put_code(0x30 + u32::from(b), 8);
        } else {
            self.bw.put_code(0x190 + u32::from(b) - 144, 9);
        }
    }

    pub fn literals(&mut self, data: &[u8]) {
        for &b in data {
            self.literal(b);
        }
    }

    pub fn backref(&mut self, len: usize, dist: usize) {
        assert!((3..=258).contains(&len) && (1..=32768).contains(&dist));
        let li = LEN_BASE
            .iter()
            .rposition(|&base| usize::from(base) <= len)
            .unwrap();
        let sym = 257 + li;
        if sym <= 279 {
            self.bw.put_code(sym as u32 - 256, 7);
        } else {
            self.bw.put_code(0xc0 + sym as u32 - 280, 8);
        }
        self.bw
            .put_bits((len - usize::from(LEN_BASE[li])) as u32, u32::from(LEN_EXTRA[li]));
        let di = DIST_BASE
            .iter()
            .rposition(|&base| usize::from(base) <= dist)
            .unwrap();
        self.bw.put_code(di as u32, 5);
        self.bw
            .put_bits((dist - usize::from(DIST_BASE[di])) as u32, u32::from(DIST_EXTRA[di]));
    }

    pub fn end_block(&mut self) {
        self.bw.put_code(0, 7);
    }

    pub fn finish(self) -> Vec<u8> {
        self.bw.finish()
    }
}

impl Default for FixedEncoder {
    fn default() -> Self {
        FixedEncoder::new()
    }
}

/// A raw stream of stored blocks (at most 65535 bytes each).
pub fn stored_stream(data: &[u8]) -> Vec<u8> {
    let mut bw = BitWriter::new();
    let mut chunks = data.chunks(65535).peekable();
    if data.is_empty() {
        bw.put_bits(1, 1);
        bw.put_bits(0, 2);
        bw.align();
        bw.put_aligned_bytes(&[0, 0, 0xff, 0xff]);
    }
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        bw.put_bits(u32::from(last), 1);
        bw.put_bits(0, 2);
        bw.align();
        let len = chunk.len() as u16;
        bw.put_aligned_bytes(&len.to_le_bytes());
        bw.put_aligned_bytes(&(!len).to_le_bytes());
        bw.put_aligned_bytes(chunk);
    }
    bw.finish()
}

pub fn crc32_of(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn adler32_of(data: &[u8]) -> u32 {
    let mut a = RollingAdler32::new();
    a.update_buffer(data);
    a.hash()
}

/// Raw deflate via the reference encoder.
pub fn deflate(data: &[u8], level: u8) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec(data, level)
}

pub const FHCRC: u8 = 1 << 1;
pub const FEXTRA: u8 = 1 << 2;
pub const FNAME: u8 = 1 << 3;
pub const FCOMMENT: u8 = 1 << 4;

/// Wraps a raw deflate stream in a minimal gzip member.
pub fn gzip_container(raw: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
    out.extend_from_slice(raw);
    out.extend_from_slice(&crc32_of(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

/// Builds a gzip member exercising any combination of the optional header
/// fields.
pub fn gzip_custom(
    flags: u8,
    extra: &[u8],
    name: &[u8],
    comment: &[u8],
    raw: &[u8],
    data: &[u8],
) -> Vec<u8> {
    let mut out = vec![0x1f, 0x8b, 0x08, flags, 0x78, 0x56, 0x34, 0x12, 0x00, 0x03];
    if flags & FEXTRA != 0 {
        out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        out.extend_from_slice(extra);
    }
    if flags & FNAME != 0 {
        out.extend_from_slice(name);
        out.push(0);
    }
    if flags & FCOMMENT != 0 {
        out.extend_from_slice(comment);
        out.push(0);
    }
    if flags & FHCRC != 0 {
        let crc16 = crc32_of(&out) as u16;
        out.extend_from_slice(&crc16.to_le_bytes());
    }
    out.extend_from_slice(raw);
    out.extend_from_slice(&crc32_of(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

/// Compressible text-like data; large enough inputs come out of the
/// reference encoder as dynamic-Huffman blocks.
pub fn text_like(len: usize) -> Vec<u8> {
    const WORDS: [&str; 8] = [
        "stream", "window", "history", "resume", "deflate", "buffer", "target", "source",
    ];
    let mut out = Vec::with_capacity(len + 16);
    let mut i = 0usize;
    while out.len() < len {
        out.extend_from_slice(WORDS[i % WORDS.len()].as_bytes());
        out.extend_from_slice(i.to_string().as_bytes());
        out.push(b' ');
        i += 1;
    }
    out.truncate(len);
    out
}

pub fn gzip_of(data: &[u8], level: u8) -> Vec<u8> {
    gzip_container(&deflate(data, level), data)
}

/// Wraps a raw deflate stream in a zlib container.
pub fn zlib_container(raw: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x78, 0x9c];
    out.extend_from_slice(raw);
    out.extend_from_slice(&adler32_of(data).to_be_bytes());
    out
}

pub fn zlib_of(data: &[u8], level: u8) -> Vec<u8> {
    zlib_container(&deflate(data, level), data)
}

/// A zlib container announcing a preset dictionary.
pub fn zlib_with_dict(raw: &[u8], data: &[u8], dict: &[u8]) -> Vec<u8> {
    let cmf = 0x78u32;
    let mut flg = 0x20u32;
    let rem = (cmf * 256 + flg) % 31;
    if rem != 0 {
        flg += 31 - rem;
    }
    let mut out = vec![cmf as u8, flg as u8];
    out.extend_from_slice(&adler32_of(dict).to_be_bytes());
    out.extend_from_slice(raw);
    out.extend_from_slice(&adler32_of(data).to_be_bytes());
    out
}

// ---------------------------------------------------------------------------
// drivers

pub fn soft_decompress(wrap: Wrap) -> Decompress {
    Decompress::new(Box::new(SoftNx), wrap).unwrap()
}

/// Feeds `input` in `in_chunk`-sized pieces, collecting output through an
/// `out_chunk`-sized buffer, until the stream ends.
pub fn run_stream(
    dec: &mut Decompress,
    input: &[u8],
    in_chunk: usize,
    out_chunk: usize,
    flush: FlushDecompress,
) -> Result<Vec<u8>, DecompressError> {
    let in_chunk = in_chunk.max(1);
    let mut out = Vec::new();
    let mut buf = vec![0u8; out_chunk.max(1)];
    let mut consumed = 0usize;
    let mut stalls = 0;
    loop {
        let end = (consumed + in_chunk).min(input.len());
        let before_in = dec.total_in();
        let before_out = dec.total_out();
        let status = dec.decompress(&input[consumed..end], &mut buf, flush)?;
        let took = dec.total_in().saturating_sub(before_in) as usize;
        let wrote = (dec.total_out() - before_out) as usize;
        consumed = (consumed + took).min(input.len());
        out.extend_from_slice(&buf[..wrote]);
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                if took == 0 && wrote == 0 && consumed >= input.len() {
                    stalls += 1;
                    assert!(stalls < 3, "stream stalled before its end");
                } else {
                    stalls = 0;
                }
            }
        }
    }
}

/// One-call decompression into a single large buffer.
pub fn run_single_shot(
    dec: &mut Decompress,
    input: &[u8],
    max_out: usize,
) -> Result<Vec<u8>, DecompressError> {
    let mut buf = vec![0u8; max_out.max(1)];
    let mut produced = 0usize;
    let mut consumed = 0usize;
    loop {
        let status = dec.decompress(
            &input[consumed..],
            &mut buf[produced..],
            FlushDecompress::Finish,
        )?;
        consumed = dec.total_in() as usize;
        produced = dec.total_out() as usize;
        if status == Status::StreamEnd {
            buf.truncate(produced);
            return Ok(buf);
        }
        assert_ne!(status, Status::BufError, "output buffer sized too small");
    }
}
