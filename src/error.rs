//! The single error channel of the codec.
//!
//! Every fallible operation in the pipeline returns [`Result`]; a fatal
//! error leaves the codec state unusable and the caller is expected to
//! drop it and start over.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A parameter combination yields zero-sized or overflowing extents.
  #[error("invalid geometry: {0}")]
  InvalidGeometry(String),

  /// An option is out of its documented range.
  #[error("invalid parameter: {0}")]
  InvalidParameter(String),

  /// A memory request could not be satisfied.
  #[error("allocation of {0} bytes failed")]
  Allocation(usize),

  /// The wire bytes violate codestream syntax.
  #[error("corrupt codestream: {0}")]
  CorruptCodestream(String),

  /// Tier-1 decode reached an impossible state.
  #[error("corrupt codeblock: {0}")]
  CorruptCodeblock(String),

  /// The underlying stream failed to read, write or seek.
  #[error("stream I/O error: {0}")]
  Io(String),

  /// A recognised but unimplemented feature or marker.
  #[error("unsupported feature: {0}")]
  Unsupported(String),
}

pub type Result<T> = core::result::Result<T, Error>;
