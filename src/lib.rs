//! A JPEG 2000 (ISO/IEC 15444-1) tile-pipeline codec.
//!
//! The crate implements the core codestream pipeline: tile geometry, DC
//! shift and multi-component transforms, the 5/3 and 9/7 wavelet
//! transforms, EBCOT tier-1 coding, PCRD rate allocation, and tier-2
//! packetization, behind a [`Codec`] front end reading and writing raw
//! codestreams through a [`ByteStream`].
//!
//! File-format boxes (JP2), image-file I/O and colour management are out
//! of scope; embedders wrap the raw codestream themselves.

mod bio;
mod dwt;
mod j2k;
mod math;
mod mct;
mod mqc;
mod pi;
mod t1;
mod t2;
mod tcd;
mod tgt;

pub mod cio;
pub mod error;
pub mod image;
pub mod params;

pub use cio::{ByteStream, Media};
pub use error::{Error, Result};
pub use image::{Image, ImageComp, ImageCompParams};
pub use j2k::Codec;
pub use params::{
  CblkStyle, CompressParams, Csty, CustomMct, DecompressParams, Mct, ProgOrder, RateControl,
};

/// Magic bytes opening every raw codestream.
pub const J2K_CODESTREAM_MAGIC: &[u8] = &[0xff, 0x4f, 0xff, 0x51];

/// True when `buf` starts like a raw JPEG 2000 codestream.
pub fn is_codestream(buf: &[u8]) -> bool {
  buf.starts_with(J2K_CODESTREAM_MAGIC)
}
