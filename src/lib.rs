//! Streaming DEFLATE decompression offloaded to a nest accelerator.
//!
//! This crate implements the software half of a hardware-assisted inflate
//! path: it parses raw/zlib/gzip container framing byte-by-byte, stages
//! compressed input and decompressed history in a pair of page-aligned
//! buffers, and drives an external DEFLATE engine one job at a time over the
//! compressed payload. A single logical stream may be decoded by an arbitrary
//! sequence of independent accelerator invocations; the 32 KiB sliding-window
//! history, the unprocessed-bit count, the dynamic-Huffman table and the
//! running checksums are carried from one job to the next so decompression
//! can suspend and resume at any point of the bitstream.
//!
//! The accelerator itself is not part of this crate. It is consumed through
//! the [`nx::Accelerator`] trait together with the descriptor-list and
//! command-block types in [`nx`]; platform integrations (or software models,
//! for testing) supply the implementation. There is no software DEFLATE
//! fallback: without a device the stream cannot make progress.
//!
//! The caller-facing API mirrors zlib's in-memory decompression surface:
//!
//! ```no_run
//! use nxflate::{Decompress, FlushDecompress, Status, Wrap};
//!
//! # fn open_device() -> Box<dyn nxflate::nx::Accelerator> { unimplemented!() }
//! # fn main() -> Result<(), nxflate::DecompressError> {
//! let mut stream = Decompress::new(open_device(), Wrap::Gzip)?;
//! let input = std::fs::read("data.gz").unwrap();
//! let mut output = vec![0u8; 64 * 1024];
//! loop {
//!     let consumed = stream.total_in() as usize;
//!     let produced = stream.total_out() as usize;
//!     let status = stream.decompress(
//!         &input[consumed..],
//!         &mut output[produced..],
//!         FlushDecompress::None,
//!     )?;
//!     if let Status::StreamEnd = status {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod engine;
mod fifo;
mod header;
mod mem;
pub mod nx;
pub mod stats;

pub use crate::config::Config;
pub use crate::header::{GzHeader, Wrap};
pub use crate::mem::{Decompress, DecompressError, FlushDecompress, Status};

/// Fixed length of the DEFLATE history window carried between accelerator
/// jobs, in bytes.
pub const INF_HIS_LEN: usize = 32 * 1024;
