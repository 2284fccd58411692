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

/*
==========================================================
   Individual bit input-output stream (packet headers)
==========================================================
*/

//! Bit-level I/O for packet headers. After a 0xFF byte the next byte
//! carries only seven payload bits; the MSB is a stuffed zero.

/// Bit writer accumulating into an owned buffer.
pub(crate) struct BioEncoder {
  out: Vec<u8>,
  buf: u32,
  ct: u32,
}

impl BioEncoder {
  pub fn new() -> Self {
    BioEncoder { out: Vec::new(), buf: 0, ct: 8 }
  }

  fn byteout(&mut self) {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    self.out.push((self.buf >> 8) as u8);
  }

  pub fn putbit(&mut self, b: u32) {
    if self.ct == 0 {
      self.byteout();
    }
    self.ct -= 1;
    self.buf |= (b & 1) << self.ct;
  }

  /// Write the `n` low bits of `v`, most significant first.
  pub fn write(&mut self, v: u32, n: u32) {
    for i in (0..n).rev() {
      self.putbit((v >> i) & 1);
    }
  }

  /// Flush the pending byte, stuffing after a trailing 0xFF, and return
  /// the encoded bytes.
  pub fn flush(mut self) -> Vec<u8> {
    self.byteout();
    if self.ct == 7 {
      self.byteout();
    }
    self.out
  }
}

/// Bit reader over a borrowed byte slice.
pub(crate) struct BioDecoder<'a> {
  data: &'a [u8],
  pos: usize,
  buf: u32,
  ct: u32,
}

impl<'a> BioDecoder<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    BioDecoder { data, pos: 0, buf: 0, ct: 0 }
  }

  fn bytein(&mut self) {
    self.buf = (self.buf << 8) & 0xffff;
    self.ct = if self.buf == 0xff00 { 7 } else { 8 };
    if self.pos < self.data.len() {
      self.buf |= self.data[self.pos] as u32;
      self.pos += 1;
    }
  }

  pub fn getbit(&mut self) -> u32 {
    if self.ct == 0 {
      self.bytein();
    }
    self.ct -= 1;
    (self.buf >> self.ct) & 1
  }

  /// Read `n` bits, most significant first.
  pub fn read(&mut self, n: u32) -> u32 {
    let mut v = 0u32;
    for _ in 0..n {
      v = (v << 1) | self.getbit();
    }
    v
  }

  /// Byte-align the reader, consuming the stuffing byte after a 0xFF,
  /// and return how many bytes were consumed.
  pub fn inalign(mut self) -> usize {
    if (self.buf & 0xff) == 0xff {
      self.bytein();
    }
    self.pos
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip_plain_bits() {
    let mut enc = BioEncoder::new();
    enc.write(0b1011, 4);
    enc.write(0x5a, 8);
    let bytes = enc.flush();
    let mut dec = BioDecoder::new(&bytes);
    assert_eq!(dec.read(4), 0b1011);
    assert_eq!(dec.read(8), 0x5a);
  }

  #[test]
  fn ff_byte_gets_stuffed() {
    let mut enc = BioEncoder::new();
    enc.write(0xff, 8);
    enc.write(0b101, 3);
    let bytes = enc.flush();
    // second byte carries only seven payload bits
    assert_eq!(bytes[0], 0xff);
    assert_eq!(bytes[1] & 0x80, 0);
    let mut dec = BioDecoder::new(&bytes);
    assert_eq!(dec.read(8), 0xff);
    assert_eq!(dec.read(3), 0b101);
  }

  #[test]
  fn trailing_ff_flush_appends_pad_byte() {
    let mut enc = BioEncoder::new();
    enc.write(0xff, 8);
    let bytes = enc.flush();
    assert_eq!(bytes, vec![0xff, 0x00]);
    let mut dec = BioDecoder::new(&bytes);
    assert_eq!(dec.read(8), 0xff);
    assert_eq!(dec.inalign(), 2);
  }

  #[test]
  fn inalign_counts_consumed_bytes() {
    let mut enc = BioEncoder::new();
    enc.write(0b1, 1);
    let bytes = enc.flush();
    assert_eq!(bytes.len(), 1);
    let mut dec = BioDecoder::new(&bytes);
    assert_eq!(dec.getbit(), 1);
    assert_eq!(dec.inalign(), 1);
  }
}
