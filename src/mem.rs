//! Raw in-memory decompression driven over the accelerator.

use std::error::Error;
use std::fmt;

use crate::config::Config;
use crate::engine::InflateStream;
use crate::header::{GzHeader, Wrap};
use crate::nx::{Accelerator, CompletionCode};

/// Values which indicate the form of flushing to be used when decompressing
/// in-memory data.
///
/// Only `Finish` changes behavior: it selects the terminal return once the
/// caller's buffers are empty. Block-boundary flush modes are not supported
/// by the offload engine and are therefore not representable here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushDecompress {
    /// A typical parameter for passing to decompression functions.
    None,
    /// All pending output is flushed to the output buffer.
    Sync,
    /// There is no more input beside what is already in the input buffer
    /// and the output buffer is large enough to hold the rest of the
    /// decompressed data.
    Finish,
}

/// Possible status results of decompressing some data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Indicates success.
    ///
    /// Means that more input may be needed but isn't available and/or
    /// there's more output to be written but the output buffer is full.
    Ok,

    /// Indicates that forward progress is not possible due to input or
    /// output buffers being empty.
    ///
    /// The stream can continue on a later call once more input or output
    /// space is supplied.
    BufError,

    /// Indicates that the end of the deflate stream has been reached and
    /// all staged output has been delivered.
    StreamEnd,
}

#[derive(Debug)]
enum ErrorKind {
    Data(&'static str),
    NeedsDictionary(u32),
    Stream(&'static str),
    Mem,
    Device {
        msg: &'static str,
        code: CompletionCode,
    },
}

/// Error returned when decompression cannot proceed: the input was not a
/// valid deflate stream, a preset dictionary is required, the stream was
/// misused, a buffer could not be allocated, or the device faulted
/// persistently.
#[derive(Debug)]
pub struct DecompressError {
    inner: ErrorKind,
}

impl DecompressError {
    /// Indicates whether decompression failed due to requiring a preset
    /// dictionary.
    ///
    /// The resulting integer is the Adler-32 checksum of the dictionary
    /// required.
    pub fn needs_dictionary(&self) -> Option<u32> {
        match self.inner {
            ErrorKind::NeedsDictionary(id) => Some(id),
            _ => None,
        }
    }

    /// The human-readable message attached to the error, if any.
    pub fn message(&self) -> Option<&'static str> {
        match self.inner {
            ErrorKind::Data(msg) | ErrorKind::Stream(msg) | ErrorKind::Device { msg, .. } => {
                Some(msg)
            }
            _ => None,
        }
    }

    pub(crate) fn data(msg: &'static str) -> DecompressError {
        DecompressError {
            inner: ErrorKind::Data(msg),
        }
    }

    pub(crate) fn need_dict(adler: u32) -> DecompressError {
        DecompressError {
            inner: ErrorKind::NeedsDictionary(adler),
        }
    }

    pub(crate) fn stream(msg: &'static str) -> DecompressError {
        DecompressError {
            inner: ErrorKind::Stream(msg),
        }
    }

    pub(crate) fn mem() -> DecompressError {
        DecompressError {
            inner: ErrorKind::Mem,
        }
    }

    pub(crate) fn device(msg: &'static str, code: CompletionCode) -> DecompressError {
        DecompressError {
            inner: ErrorKind::Device { msg, code },
        }
    }
}

impl fmt::Display for DecompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            ErrorKind::Data(msg) => write!(f, "deflate data error: {msg}"),
            ErrorKind::NeedsDictionary(id) => {
                write!(f, "deflate dictionary needed, adler {id:#010x}")
            }
            ErrorKind::Stream(msg) => write!(f, "stream error: {msg}"),
            ErrorKind::Mem => write!(f, "out of memory for decompression buffers"),
            ErrorKind::Device { msg, code } => {
                write!(f, "accelerator error: {msg} ({code:?})")
            }
        }
    }
}

impl Error for DecompressError {}

/// Raw in-memory decompression stream for blocks of data.
///
/// This type is maximally flexible in terms of accepting input from any
/// source and producing output to any memory location: the caller hands in
/// slices, and the stream advances its `total_in` / `total_out` counters to
/// report consumption. Container headers are parsed in software; the
/// DEFLATE payload is decoded by the supplied accelerator, one bounded job
/// at a time, so arbitrarily large streams decompress in constant memory.
///
/// A stream is single-owner: all methods take `&mut self` and jobs for one
/// stream are strictly serialized.
pub struct Decompress {
    inner: Box<InflateStream>,
}

impl Decompress {
    /// Creates a new stream decoding the given container framing with the
    /// default 32 KiB window.
    pub fn new(device: Box<dyn Accelerator>, wrap: Wrap) -> Result<Decompress, DecompressError> {
        Decompress::with_config(device, wrap, 15, Config::default())
    }

    /// Creates a new stream from a zlib-style `window_bits` request:
    /// negative values select a raw stream, `8..=15` zlib, `24..=31` gzip
    /// and `40..=47` automatic zlib/gzip detection. Any other value is a
    /// stream error.
    pub fn new_with_window_bits(
        device: Box<dyn Accelerator>,
        window_bits: i32,
    ) -> Result<Decompress, DecompressError> {
        let (wrap, bits) = Wrap::from_window_bits(window_bits)
            .ok_or_else(|| DecompressError::stream("invalid window bits"))?;
        Decompress::with_config(device, wrap, bits, Config::default())
    }

    /// Creates a new stream with explicit tuning knobs.
    pub fn with_config(
        device: Box<dyn Accelerator>,
        wrap: Wrap,
        window_bits: u8,
        config: Config,
    ) -> Result<Decompress, DecompressError> {
        if !(8..=15).contains(&window_bits) {
            return Err(DecompressError::stream("invalid window bits"));
        }
        Ok(Decompress {
            inner: Box::new(InflateStream::new(device, wrap, window_bits, config)),
        })
    }

    /// Returns the total number of input bytes which have been processed by
    /// this decompression object.
    pub fn total_in(&self) -> u64 {
        self.inner.total_in()
    }

    /// Returns the total number of output bytes which have been produced by
    /// this decompression object.
    pub fn total_out(&self) -> u64 {
        self.inner.total_out()
    }

    /// The zlib-style checksum of the stream: the running Adler-32 of the
    /// decompressed data for zlib and raw streams, the running CRC-32 for
    /// gzip streams, or the dictionary id right after a dictionary request.
    pub fn adler(&self) -> u32 {
        self.inner.adler()
    }

    /// The running CRC-32 of the decompressed data.
    pub fn crc32(&self) -> u32 {
        self.inner.crc32()
    }

    /// The gzip member header, once it has been fully parsed.
    pub fn gzip_header(&self) -> Option<&GzHeader> {
        self.inner.gzip_header()
    }

    /// Decompresses the input data into the output, consuming only as much
    /// input as needed and writing as much output as possible.
    ///
    /// To learn how much data was consumed or how much output was produced,
    /// use the `total_in` and `total_out` functions before/after this is
    /// called.
    pub fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        flush: FlushDecompress,
    ) -> Result<Status, DecompressError> {
        self.inner.inflate(input, output, flush)
    }

    /// Decompresses the input data into the extra space in the output
    /// vector.
    ///
    /// This will not reallocate the vector provided or attempt to grow it,
    /// so space for the output must be reserved by the caller before
    /// calling this function.
    pub fn decompress_vec(
        &mut self,
        input: &[u8],
        output: &mut Vec<u8>,
        flush: FlushDecompress,
    ) -> Result<Status, DecompressError> {
        let len = output.len();
        let cap = output.capacity();
        output.resize(cap, 0);
        let before = self.total_out();
        let ret = self.decompress(input, &mut output[len..], flush);
        let written = (self.total_out() - before) as usize;
        output.truncate(len + written);
        ret
    }

    /// Supplies the preset dictionary a zlib stream with the FDICT flag
    /// asked for.
    ///
    /// Valid only after `decompress` failed with
    /// [`DecompressError::needs_dictionary`]; the dictionary's Adler-32
    /// must match the id the stream announced. The trailing 32 KiB of the
    /// dictionary become the history window for the next job.
    pub fn set_dictionary(&mut self, dictionary: &[u8]) -> Result<(), DecompressError> {
        self.inner.set_dictionary(dictionary)
    }

    /// Performs the equivalent of replacing this decompression state with a
    /// freshly allocated copy, keeping the container framing and the
    /// device.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl fmt::Debug for Decompress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decompress")
            .field("total_in", &self.total_in())
            .field("total_out", &self.total_out())
            .finish_non_exhaustive()
    }
}
