/*
 * The copyright in this software is being made available under the 2-clauses
 * BSD License, included below. This software may be subject to other third
 * party and contributor rights, including patent rights, and no such rights
 * are granted under this license.
 *
 * Copyright (c) 2002-2014, Universite catholique de Louvain (UCL), Belgium
 * Copyright (c) 2002-2014, Professor Benoit Macq
 * Copyright (c) 2005, Herve Drolon, FreeImage Team
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions
 * are met:
 * 1. Redistributions of source code must retain the above copyright
 *    notice, this list of conditions and the following disclaimer.
 * 2. Redistributions in binary form must reproduce the above copyright
 *    notice, this list of conditions and the following disclaimer in the
 *    documentation and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS `AS IS'
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
 * ARE DISCLAIMED.  IN NO EVENT SHALL THE COPYRIGHT OWNER OR CONTRIBUTORS BE
 * LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR
 * CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF
 * SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS
 * INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN
 * CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE)
 * ARISING IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
 * POSSIBILITY OF SUCH DAMAGE.
 */

//! Buffered, seekable byte I/O.
//!
//! A [`ByteStream`] is either *owning* (it wraps a [`Media`] and maintains
//! an internal window buffer) or *borrowing* (it indexes directly into a
//! caller-provided slice or an in-memory vector). All multi-byte integers
//! on the wire are serialised big-endian regardless of host order.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// The external media contract the owning stream drives.
///
/// `read` returns `None` at true end-of-stream (the `(size_t)-1` sentinel
/// of the C contract); a `Some(0)` is not an error. `seek` is absolute.
pub trait Media: Send {
  fn read(&mut self, buf: &mut [u8]) -> Option<usize>;
  fn write(&mut self, buf: &[u8]) -> usize;
  fn seek(&mut self, offset: u64) -> bool;
}

enum Backing<'a> {
  /// Owning mode: media + internal window buffer.
  Owned {
    media: Box<dyn Media + 'a>,
    buffer: Vec<u8>,
    /// Stream offset of `buffer[0]`.
    window_start: u64,
    /// Valid bytes in the window (read mode) or pending bytes (write mode).
    window_len: usize,
    /// Cursor within the window.
    cursor: usize,
    writing: bool,
  },
  /// Borrowing mode: direct indexing into a caller slice.
  Borrowed { data: &'a [u8], pos: usize },
  /// Owning in-memory writer.
  Memory { data: Vec<u8>, pos: usize },
}

pub struct ByteStream<'a> {
  backing: Backing<'a>,
  at_end: bool,
}

impl<'a> ByteStream<'a> {
  /// Buffered stream over external media.
  pub fn from_media(media: Box<dyn Media + 'a>, buffer_size: usize, writing: bool) -> Self {
    ByteStream {
      backing: Backing::Owned {
        media,
        buffer: vec![0u8; buffer_size.max(64)],
        window_start: 0,
        window_len: 0,
        cursor: 0,
        writing,
      },
      at_end: false,
    }
  }

  /// Borrowing read-only stream over a caller buffer.
  pub fn from_slice(data: &'a [u8]) -> Self {
    ByteStream {
      backing: Backing::Borrowed { data, pos: 0 },
      at_end: false,
    }
  }

  /// Growable in-memory stream, usable for both directions.
  pub fn from_vec(data: Vec<u8>) -> Self {
    ByteStream {
      backing: Backing::Memory { data, pos: 0 },
      at_end: false,
    }
  }

  /// Take back the bytes of an in-memory stream.
  pub fn into_vec(self) -> Vec<u8> {
    match self.backing {
      Backing::Memory { data, .. } => data,
      _ => Vec::new(),
    }
  }

  /// True once a read came up short at end-of-stream.
  pub fn is_at_end(&self) -> bool {
    self.at_end
  }

  pub fn tell(&self) -> u64 {
    match &self.backing {
      Backing::Owned { window_start, cursor, .. } => window_start + *cursor as u64,
      Backing::Borrowed { pos, .. } => *pos as u64,
      Backing::Memory { pos, .. } => *pos as u64,
    }
  }

  /// Bytes left before end-of-stream, when the backing knows it.
  pub fn bytes_left(&self) -> Option<u64> {
    match &self.backing {
      Backing::Borrowed { data, pos } => Some((data.len() - pos) as u64),
      Backing::Memory { data, pos } => Some((data.len() - pos) as u64),
      Backing::Owned { .. } => None,
    }
  }

  /// Read up to `buf.len()` bytes. A short count means end-of-stream was
  /// reached; the end flag is set and subsequent reads return 0.
  pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    match &mut self.backing {
      Backing::Borrowed { data, pos } => {
        let avail = data.len() - *pos;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        if n < buf.len() {
          self.at_end = true;
        }
        Ok(n)
      }
      Backing::Memory { data, pos } => {
        let avail = data.len().saturating_sub(*pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        if n < buf.len() {
          self.at_end = true;
        }
        Ok(n)
      }
      Backing::Owned {
        media,
        buffer,
        window_start,
        window_len,
        cursor,
        writing,
      } => {
        if *writing {
          return Err(Error::Io("read on a write stream".into()));
        }
        let mut copied = 0usize;
        loop {
          let avail = *window_len - *cursor;
          let want = buf.len() - copied;
          let n = avail.min(want);
          buf[copied..copied + n].copy_from_slice(&buffer[*cursor..*cursor + n]);
          *cursor += n;
          copied += n;
          if copied == buf.len() {
            return Ok(copied);
          }
          // refill the window
          *window_start += *window_len as u64;
          *cursor = 0;
          *window_len = 0;
          match media.read(buffer) {
            Some(0) | None => {
              self.at_end = true;
              return Ok(copied);
            }
            Some(got) => {
              *window_len = got;
            }
          }
        }
      }
    }
  }

  /// Zero-copy read: a borrowed view of the next `n` bytes, shorter at
  /// end-of-stream. Only the borrowing and memory modes support it.
  pub fn zero_copy_read(&mut self, n: usize) -> Option<&[u8]> {
    match &mut self.backing {
      Backing::Borrowed { data, pos } => {
        let take = n.min(data.len() - *pos);
        let out = &data[*pos..*pos + take];
        *pos += take;
        if take < n {
          self.at_end = true;
        }
        Some(out)
      }
      Backing::Memory { data, pos } => {
        let take = n.min(data.len().saturating_sub(*pos));
        let start = *pos;
        *pos += take;
        if take < n {
          self.at_end = true;
        }
        Some(&data[start..start + take])
      }
      Backing::Owned { .. } => None,
    }
  }

  pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
    match &mut self.backing {
      Backing::Borrowed { .. } => Err(Error::Io("write on a read-only stream".into())),
      Backing::Memory { data, pos } => {
        if *pos + bytes.len() > data.len() {
          data.resize(*pos + bytes.len(), 0);
        }
        data[*pos..*pos + bytes.len()].copy_from_slice(bytes);
        *pos += bytes.len();
        Ok(())
      }
      Backing::Owned {
        media,
        buffer,
        window_start,
        window_len,
        cursor,
        writing,
      } => {
        if !*writing {
          return Err(Error::Io("write on a read stream".into()));
        }
        let mut rest = bytes;
        while !rest.is_empty() {
          let room = buffer.len() - *cursor;
          let n = room.min(rest.len());
          buffer[*cursor..*cursor + n].copy_from_slice(&rest[..n]);
          *cursor += n;
          *window_len = (*window_len).max(*cursor);
          rest = &rest[n..];
          if *cursor == buffer.len() {
            let put = media.write(&buffer[..*window_len]);
            if put != *window_len {
              return Err(Error::Io("short write".into()));
            }
            *window_start += *window_len as u64;
            *window_len = 0;
            *cursor = 0;
          }
        }
        Ok(())
      }
    }
  }

  /// Flush pending buffered bytes to the media. A no-op for memory modes.
  pub fn flush(&mut self) -> Result<()> {
    if let Backing::Owned {
      media,
      buffer,
      window_start,
      window_len,
      cursor,
      writing,
    } = &mut self.backing
    {
      if *writing && *window_len > 0 {
        let put = media.write(&buffer[..*window_len]);
        if put != *window_len {
          return Err(Error::Io("short write on flush".into()));
        }
        *window_start += *window_len as u64;
        *window_len = 0;
        *cursor = 0;
      }
    }
    Ok(())
  }

  /// Absolute seek. If the target lies inside the buffered window the
  /// cursor just moves; otherwise the window is invalidated and the media
  /// seeks.
  pub fn seek(&mut self, offset: u64) -> Result<()> {
    self.at_end = false;
    match &mut self.backing {
      Backing::Borrowed { data, pos } => {
        if offset > data.len() as u64 {
          return Err(Error::Io(format!("seek past end ({offset})")));
        }
        *pos = offset as usize;
        Ok(())
      }
      Backing::Memory { data, pos } => {
        if offset > data.len() as u64 {
          data.resize(offset as usize, 0);
        }
        *pos = offset as usize;
        Ok(())
      }
      Backing::Owned {
        media,
        window_start,
        window_len,
        cursor,
        writing,
        ..
      } => {
        if *writing {
          // pending bytes must reach the media before repositioning
          return Err(Error::Io("seek on an unflushed write stream".into()));
        }
        if offset >= *window_start && offset < *window_start + *window_len as u64 {
          *cursor = (offset - *window_start) as usize;
          return Ok(());
        }
        if !media.seek(offset) {
          return Err(Error::Io(format!("media seek to {offset} failed")));
        }
        *window_start = offset;
        *window_len = 0;
        *cursor = 0;
        Ok(())
      }
    }
  }

  /// Relative forward seek.
  pub fn skip(&mut self, n: u64) -> Result<()> {
    let target = self.tell() + n;
    self.seek(target)
  }

  /// Write the low `nbytes` bytes of `value`, most significant first.
  pub fn write_bytes_be(&mut self, value: u64, nbytes: usize) -> Result<()> {
    debug_assert!((1..=8).contains(&nbytes));
    let mut tmp = [0u8; 8];
    BigEndian::write_uint(&mut tmp[..nbytes], value, nbytes);
    self.write(&tmp[..nbytes])
  }

  /// Read `nbytes` bytes as a big-endian unsigned integer.
  pub fn read_bytes_be(&mut self, nbytes: usize) -> Result<u64> {
    debug_assert!((1..=8).contains(&nbytes));
    let mut tmp = [0u8; 8];
    let got = self.read(&mut tmp[..nbytes])?;
    if got != nbytes {
      return Err(Error::CorruptCodestream(format!(
        "stream truncated: wanted {nbytes} bytes, got {got}"
      )));
    }
    Ok(BigEndian::read_uint(&tmp[..nbytes], nbytes))
  }

  pub fn write_u8(&mut self, v: u8) -> Result<()> {
    self.write(&[v])
  }

  pub fn write_u16(&mut self, v: u16) -> Result<()> {
    self.write_bytes_be(v as u64, 2)
  }

  pub fn write_u32(&mut self, v: u32) -> Result<()> {
    self.write_bytes_be(v as u64, 4)
  }

  pub fn read_u8(&mut self) -> Result<u8> {
    Ok(self.read_bytes_be(1)? as u8)
  }

  pub fn read_u16(&mut self) -> Result<u16> {
    Ok(self.read_bytes_be(2)? as u16)
  }

  pub fn read_u32(&mut self) -> Result<u32> {
    Ok(self.read_bytes_be(4)? as u32)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct VecMedia {
    data: Vec<u8>,
    pos: usize,
  }

  impl Media for VecMedia {
    fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
      let avail = self.data.len().saturating_sub(self.pos);
      if avail == 0 {
        return None;
      }
      let n = avail.min(buf.len());
      buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
      self.pos += n;
      Some(n)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
      if self.pos + buf.len() > self.data.len() {
        self.data.resize(self.pos + buf.len(), 0);
      }
      self.data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
      self.pos += buf.len();
      buf.len()
    }

    fn seek(&mut self, offset: u64) -> bool {
      self.pos = offset as usize;
      true
    }
  }

  #[test]
  fn big_endian_wire_ints() {
    let mut s = ByteStream::from_vec(Vec::new());
    s.write_u16(0xff4f).unwrap();
    s.write_bytes_be(0x0000_0102_0304, 6).unwrap();
    let data = s.into_vec();
    assert_eq!(data, vec![0xff, 0x4f, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04]);

    let mut r = ByteStream::from_slice(&data);
    assert_eq!(r.read_u16().unwrap(), 0xff4f);
    assert_eq!(r.read_bytes_be(6).unwrap(), 0x0000_0102_0304);
  }

  #[test]
  fn short_read_sets_end_flag() {
    let data = [1u8, 2, 3];
    let mut s = ByteStream::from_slice(&data);
    let mut buf = [0u8; 8];
    assert_eq!(s.read(&mut buf).unwrap(), 3);
    assert!(s.is_at_end());
    assert_eq!(s.read(&mut buf).unwrap(), 0);
  }

  #[test]
  fn seek_then_read_is_position_independent() {
    // seek(a); seek(b); read == seek(b); read
    let data: Vec<u8> = (0u8..64).collect();
    let mut s = ByteStream::from_slice(&data);
    s.seek(10).unwrap();
    s.seek(33).unwrap();
    let mut a = [0u8; 4];
    s.read(&mut a).unwrap();

    let mut s2 = ByteStream::from_slice(&data);
    s2.seek(33).unwrap();
    let mut b = [0u8; 4];
    s2.read(&mut b).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn buffered_media_read_spans_windows() {
    let media = VecMedia { data: (0u8..=255).collect(), pos: 0 };
    let mut s = ByteStream::from_media(Box::new(media), 64, false);
    let mut buf = [0u8; 200];
    assert_eq!(s.read(&mut buf).unwrap(), 200);
    assert_eq!(buf[199], 199);
    assert_eq!(s.tell(), 200);
  }

  #[test]
  fn buffered_media_seek_within_window() {
    let media = VecMedia { data: (0u8..=255).collect(), pos: 0 };
    let mut s = ByteStream::from_media(Box::new(media), 128, false);
    let mut buf = [0u8; 16];
    s.read(&mut buf).unwrap();
    // window now holds [0,128); an in-window seek must not touch the media
    s.seek(100).unwrap();
    let mut one = [0u8; 1];
    s.read(&mut one).unwrap();
    assert_eq!(one[0], 100);
  }

  #[test]
  fn buffered_writes_flush_when_full() {
    let media = VecMedia { data: Vec::new(), pos: 0 };
    let mut s = ByteStream::from_media(Box::new(media), 64, true);
    let payload: Vec<u8> = (0u8..150).collect();
    s.write(&payload).unwrap();
    s.flush().unwrap();
    assert_eq!(s.tell(), 150);
  }

  #[test]
  fn zero_copy_read_borrows() {
    let data = [9u8, 8, 7, 6];
    let mut s = ByteStream::from_slice(&data);
    assert_eq!(s.zero_copy_read(2), Some(&data[0..2]));
    assert_eq!(s.tell(), 2);
  }
}
