//! Byte-at-a-time parsing of raw, zlib and gzip container framing.
//!
//! The parser is a resumable state machine: it consumes caller input a byte
//! at a time, returns to the caller whenever input runs out mid-field, and
//! picks up where it left off on the next call. Multi-byte fields accumulate
//! through a held-byte counter; gzip MTIME/XLEN/CRC16 are little-endian on
//! the wire and accumulated as such, the zlib DICTID is big-endian. Header
//! violations latch the stream in a data-error state.

use crc32fast::Hasher;

use crate::config::Config;

/// Framing applied around the DEFLATE payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wrap {
    /// Bare DEFLATE bitstream, no container.
    Raw,
    /// RFC 1950 zlib container.
    Zlib,
    /// RFC 1952 gzip container.
    Gzip,
    /// Sniff the first byte and decode either zlib or gzip.
    Auto,
}

impl Wrap {
    /// Decodes a zlib-style `windowBits` request: negative values select a
    /// raw stream, 8..=15 zlib, 24..=31 gzip, 40..=47 automatic detection.
    pub(crate) fn from_window_bits(bits: i32) -> Option<(Wrap, u8)> {
        match bits {
            -15..=-8 => Some((Wrap::Raw, (-bits) as u8)),
            8..=15 => Some((Wrap::Zlib, bits as u8)),
            24..=31 => Some((Wrap::Gzip, (bits - 16) as u8)),
            40..=47 => Some((Wrap::Auto, (bits - 32) as u8)),
            _ => None,
        }
    }
}

const FTEXT: u8 = 1 << 0;
const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;
const FRESERVED: u8 = 0xe0;

/// Metadata recovered from a gzip member header.
///
/// The stream owns one of these; it fills in as header bytes arrive and is
/// complete once the DEFLATE payload begins. Field lengths are bounded by
/// the configured caps, so a malformed header cannot grow it without limit.
#[derive(Clone, Debug, Default)]
pub struct GzHeader {
    text: bool,
    mtime: u32,
    xflags: u8,
    os: u8,
    extra: Option<Vec<u8>>,
    extra_len: u32,
    name: Option<Vec<u8>>,
    comment: Option<Vec<u8>>,
    hcrc: bool,
    pub(crate) done: i8,
}

impl GzHeader {
    /// Whether the FLG field marked the member as text.
    pub fn text(&self) -> bool {
        self.text
    }

    /// Modification time, seconds since the Unix epoch; 0 if absent.
    pub fn mtime(&self) -> u32 {
        self.mtime
    }

    /// The XFL byte.
    pub fn xflags(&self) -> u8 {
        self.xflags
    }

    /// The OS byte; 255 means unknown.
    pub fn operating_system(&self) -> u8 {
        self.os
    }

    /// The EXTRA field, truncated to the configured cap, if present.
    pub fn extra(&self) -> Option<&[u8]> {
        self.extra.as_deref()
    }

    /// Length of the EXTRA field as declared on the wire, which may exceed
    /// the stored bytes.
    pub fn extra_len(&self) -> u32 {
        self.extra_len
    }

    /// The original file name, truncated to the configured cap, if present.
    pub fn filename(&self) -> Option<&[u8]> {
        self.name.as_deref()
    }

    /// The COMMENT field, truncated to the configured cap, if present.
    pub fn comment(&self) -> Option<&[u8]> {
        self.comment.as_deref()
    }

    /// Whether the header carried (and passed) a CRC16 of itself.
    pub fn hcrc(&self) -> bool {
        self.hcrc
    }

    pub(crate) fn reset(&mut self, done: i8) {
        *self = GzHeader {
            done,
            ..GzHeader::default()
        };
    }
}

/// Parse states, one per header byte group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InfState {
    Header,
    GzipId1,
    GzipId2,
    GzipCm,
    GzipFlg,
    GzipMtime,
    GzipXfl,
    GzipOs,
    GzipXlen,
    GzipExtra,
    GzipName,
    GzipComment,
    GzipHcrc,
    ZlibId1,
    ZlibFlg,
    ZlibDictId,
    ZlibDict,
    Inflate,
    DataError,
}

/// Outcome of feeding input to the parser.
pub(crate) enum Parse {
    /// The header is complete; the DEFLATE payload begins at the cursor.
    Enter,
    /// Input ran out mid-header; call again with more.
    MoreInput,
    /// A preset dictionary with the given Adler-32 id is required.
    NeedDict(u32),
    /// The header violated the container format.
    Bad(&'static str),
}

macro_rules! get_byte {
    ($input:expr, $pos:expr) => {
        match $input.get(*$pos) {
            Some(&c) => {
                *$pos += 1;
                c
            }
            None => return Parse::MoreInput,
        }
    };
}

pub(crate) struct HeaderParser {
    pub state: InfState,
    kind: Wrap,
    held: u32,
    length: u32,
    flags: u8,
    zlib_cmf: u8,
    dictid: u32,
    stored_hcrc: u16,
    cksum: Hasher,
    extra_max: usize,
    name_max: usize,
    comm_max: usize,
}

impl HeaderParser {
    pub fn new(wrap: Wrap, cfg: &Config) -> HeaderParser {
        HeaderParser {
            state: InfState::Header,
            kind: wrap,
            held: 0,
            length: 0,
            flags: 0,
            zlib_cmf: 0,
            dictid: 0,
            stored_hcrc: 0,
            cksum: Hasher::new(),
            extra_max: cfg.extra_max,
            name_max: cfg.name_max,
            comm_max: cfg.comm_max,
        }
    }

    pub fn reset(&mut self, wrap: Wrap) {
        self.state = InfState::Header;
        self.kind = wrap;
        self.held = 0;
        self.length = 0;
        self.flags = 0;
        self.zlib_cmf = 0;
        self.dictid = 0;
        self.stored_hcrc = 0;
        self.cksum = Hasher::new();
    }

    /// The container actually in effect, with `Auto` resolved once the
    /// first byte has been seen.
    pub fn kind(&self) -> Wrap {
        self.kind
    }

    pub fn dictid(&self) -> u32 {
        self.dictid
    }

    fn bad(&mut self, msg: &'static str) -> Parse {
        self.state = InfState::DataError;
        Parse::Bad(msg)
    }

    /// Drives the state machine until the DEFLATE payload begins, input
    /// runs out, a dictionary is required, or the header is rejected.
    pub fn parse(
        &mut self,
        input: &[u8],
        pos: &mut usize,
        wrap: Wrap,
        havedict: bool,
        head: &mut GzHeader,
    ) -> Parse {
        loop {
            match self.state {
                InfState::Header => match wrap {
                    Wrap::Auto => {
                        let c = get_byte!(input, pos);
                        if c == 0x1f {
                            self.kind = Wrap::Gzip;
                            self.cksum.update(&[c]);
                            head.done = 0;
                            self.state = InfState::GzipId2;
                        } else if c & 0x0f == 8 && c >> 4 < 8 {
                            self.kind = Wrap::Zlib;
                            self.zlib_cmf = c;
                            head.done = -1;
                            self.state = InfState::ZlibFlg;
                        } else {
                            return self.bad("incorrect header");
                        }
                    }
                    Wrap::Zlib => {
                        head.done = -1;
                        self.state = InfState::ZlibId1;
                    }
                    Wrap::Gzip => {
                        head.done = 0;
                        self.state = InfState::GzipId1;
                    }
                    Wrap::Raw => {
                        self.state = InfState::Inflate;
                        return Parse::Enter;
                    }
                },

                InfState::GzipId1 => {
                    let c = get_byte!(input, pos);
                    if c != 0x1f {
                        return self.bad("incorrect gzip header");
                    }
                    self.cksum.update(&[c]);
                    self.state = InfState::GzipId2;
                }

                InfState::GzipId2 => {
                    let c = get_byte!(input, pos);
                    if c != 0x8b {
                        return self.bad("incorrect gzip header");
                    }
                    self.cksum.update(&[c]);
                    self.state = InfState::GzipCm;
                }

                InfState::GzipCm => {
                    let c = get_byte!(input, pos);
                    if c != 0x08 {
                        return self.bad("unknown compression method");
                    }
                    self.cksum.update(&[c]);
                    self.state = InfState::GzipFlg;
                }

                InfState::GzipFlg => {
                    let c = get_byte!(input, pos);
                    self.cksum.update(&[c]);
                    if c & FRESERVED != 0 {
                        return self.bad("unknown header flags set");
                    }
                    self.flags = c;
                    head.text = c & FTEXT != 0;
                    head.mtime = 0;
                    self.held = 0;
                    self.state = InfState::GzipMtime;
                }

                InfState::GzipMtime => {
                    while self.held < 4 {
                        let c = get_byte!(input, pos);
                        self.cksum.update(&[c]);
                        head.mtime |= u32::from(c) << (8 * self.held);
                        self.held += 1;
                    }
                    self.held = 0;
                    self.state = InfState::GzipXfl;
                }

                InfState::GzipXfl => {
                    let c = get_byte!(input, pos);
                    self.cksum.update(&[c]);
                    head.xflags = c;
                    self.state = InfState::GzipOs;
                }

                InfState::GzipOs => {
                    let c = get_byte!(input, pos);
                    self.cksum.update(&[c]);
                    head.os = c;
                    self.held = 0;
                    self.length = 0;
                    self.state = InfState::GzipXlen;
                }

                InfState::GzipXlen => {
                    if self.flags & FEXTRA != 0 {
                        while self.held < 2 {
                            let c = get_byte!(input, pos);
                            self.cksum.update(&[c]);
                            self.length |= u32::from(c) << (8 * self.held);
                            self.held += 1;
                        }
                        head.extra_len = self.length;
                        head.extra = Some(Vec::with_capacity(
                            (self.length as usize).min(self.extra_max),
                        ));
                    } else {
                        head.extra = None;
                    }
                    self.held = 0;
                    self.state = InfState::GzipExtra;
                }

                InfState::GzipExtra => {
                    if self.flags & FEXTRA != 0 && self.length > 0 {
                        let avail = input.len() - *pos;
                        if avail == 0 {
                            return Parse::MoreInput;
                        }
                        let copy = (self.length as usize).min(avail);
                        let chunk = &input[*pos..*pos + copy];
                        self.cksum.update(chunk);
                        if let Some(extra) = head.extra.as_mut() {
                            let room = self.extra_max.saturating_sub(extra.len());
                            extra.extend_from_slice(&chunk[..copy.min(room)]);
                        }
                        *pos += copy;
                        self.length -= copy as u32;
                        if self.length > 0 {
                            return Parse::MoreInput;
                        }
                    }
                    self.length = 0;
                    self.state = InfState::GzipName;
                }

                InfState::GzipName => {
                    if self.flags & FNAME != 0 {
                        head.name.get_or_insert_with(Vec::new);
                        loop {
                            let c = get_byte!(input, pos);
                            self.cksum.update(&[c]);
                            if c == 0 {
                                break;
                            }
                            // consume to the NUL regardless, store up to the cap
                            if let Some(name) = head.name.as_mut() {
                                if name.len() < self.name_max {
                                    name.push(c);
                                }
                            }
                        }
                    }
                    self.state = InfState::GzipComment;
                }

                InfState::GzipComment => {
                    if self.flags & FCOMMENT != 0 {
                        head.comment.get_or_insert_with(Vec::new);
                        loop {
                            let c = get_byte!(input, pos);
                            self.cksum.update(&[c]);
                            if c == 0 {
                                break;
                            }
                            if let Some(comment) = head.comment.as_mut() {
                                if comment.len() < self.comm_max {
                                    comment.push(c);
                                }
                            }
                        }
                    }
                    self.held = 0;
                    self.state = InfState::GzipHcrc;
                }

                InfState::GzipHcrc => {
                    if self.flags & FHCRC != 0 {
                        while self.held < 2 {
                            let c = get_byte!(input, pos);
                            self.stored_hcrc |= u16::from(c) << (8 * self.held);
                            self.held += 1;
                        }
                        head.hcrc = true;
                        let computed = self.cksum.clone().finalize() as u16;
                        if self.stored_hcrc != computed {
                            return self.bad("header crc mismatch");
                        }
                    } else {
                        head.hcrc = false;
                    }
                    self.held = 0;
                    head.done = 1;
                    self.state = InfState::Inflate;
                    return Parse::Enter;
                }

                InfState::ZlibId1 => {
                    let c = get_byte!(input, pos);
                    if c & 0x0f != 0x08 {
                        return self.bad("unknown compression method");
                    }
                    if c >> 4 >= 8 {
                        return self.bad("invalid window size");
                    }
                    self.zlib_cmf = c;
                    self.state = InfState::ZlibFlg;
                }

                InfState::ZlibFlg => {
                    let c = get_byte!(input, pos);
                    if (u32::from(self.zlib_cmf) * 256 + u32::from(c)) % 31 != 0 {
                        return self.bad("incorrect header check");
                    }
                    if c & 0x20 != 0 {
                        self.dictid = 0;
                        self.held = 0;
                        self.state = InfState::ZlibDictId;
                    } else {
                        self.state = InfState::Inflate;
                        return Parse::Enter;
                    }
                }

                InfState::ZlibDictId => {
                    while self.held < 4 {
                        let c = get_byte!(input, pos);
                        self.dictid = self.dictid << 8 | u32::from(c);
                        self.held += 1;
                    }
                    self.held = 0;
                    self.state = InfState::ZlibDict;
                }

                InfState::ZlibDict => {
                    if !havedict {
                        return Parse::NeedDict(self.dictid);
                    }
                    self.state = InfState::Inflate;
                    return Parse::Enter;
                }

                InfState::Inflate => return Parse::Enter,

                InfState::DataError => return Parse::Bad("data error"),
            }
        }
    }
}
