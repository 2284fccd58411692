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
   MQ arithmetic coder (ISO/IEC 15444-1 Annex C)
==========================================================
*/

/// One row of the probability state machine: Qe estimate, next state on
/// MPS, next state on LPS, MPS switch flag.
struct QeState {
  qeval: u32,
  nmps: u8,
  nlps: u8,
  switch_mps: bool,
}

#[rustfmt::skip]
static QE: [QeState; 47] = [
  QeState { qeval: 0x5601, nmps:  1, nlps:  1, switch_mps: true },
  QeState { qeval: 0x3401, nmps:  2, nlps:  6, switch_mps: false },
  QeState { qeval: 0x1801, nmps:  3, nlps:  9, switch_mps: false },
  QeState { qeval: 0x0ac1, nmps:  4, nlps: 12, switch_mps: false },
  QeState { qeval: 0x0521, nmps:  5, nlps: 29, switch_mps: false },
  QeState { qeval: 0x0221, nmps: 38, nlps: 33, switch_mps: false },
  QeState { qeval: 0x5601, nmps:  7, nlps:  6, switch_mps: true },
  QeState { qeval: 0x5401, nmps:  8, nlps: 14, switch_mps: false },
  QeState { qeval: 0x4801, nmps:  9, nlps: 14, switch_mps: false },
  QeState { qeval: 0x3801, nmps: 10, nlps: 14, switch_mps: false },
  QeState { qeval: 0x3001, nmps: 11, nlps: 17, switch_mps: false },
  QeState { qeval: 0x2401, nmps: 12, nlps: 18, switch_mps: false },
  QeState { qeval: 0x1c01, nmps: 13, nlps: 20, switch_mps: false },
  QeState { qeval: 0x1601, nmps: 29, nlps: 21, switch_mps: false },
  QeState { qeval: 0x5601, nmps: 15, nlps: 14, switch_mps: true },
  QeState { qeval: 0x5401, nmps: 16, nlps: 14, switch_mps: false },
  QeState { qeval: 0x5101, nmps: 17, nlps: 15, switch_mps: false },
  QeState { qeval: 0x4801, nmps: 18, nlps: 16, switch_mps: false },
  QeState { qeval: 0x3801, nmps: 19, nlps: 17, switch_mps: false },
  QeState { qeval: 0x3401, nmps: 20, nlps: 18, switch_mps: false },
  QeState { qeval: 0x3001, nmps: 21, nlps: 19, switch_mps: false },
  QeState { qeval: 0x2801, nmps: 22, nlps: 19, switch_mps: false },
  QeState { qeval: 0x2401, nmps: 23, nlps: 20, switch_mps: false },
  QeState { qeval: 0x2201, nmps: 24, nlps: 21, switch_mps: false },
  QeState { qeval: 0x1c01, nmps: 25, nlps: 22, switch_mps: false },
  QeState { qeval: 0x1801, nmps: 26, nlps: 23, switch_mps: false },
  QeState { qeval: 0x1601, nmps: 27, nlps: 24, switch_mps: false },
  QeState { qeval: 0x1401, nmps: 28, nlps: 25, switch_mps: false },
  QeState { qeval: 0x1201, nmps: 29, nlps: 26, switch_mps: false },
  QeState { qeval: 0x1101, nmps: 30, nlps: 27, switch_mps: false },
  QeState { qeval: 0x0ac1, nmps: 31, nlps: 28, switch_mps: false },
  QeState { qeval: 0x09c1, nmps: 32, nlps: 29, switch_mps: false },
  QeState { qeval: 0x08a1, nmps: 33, nlps: 30, switch_mps: false },
  QeState { qeval: 0x0521, nmps: 34, nlps: 31, switch_mps: false },
  QeState { qeval: 0x0441, nmps: 35, nlps: 32, switch_mps: false },
  QeState { qeval: 0x02a1, nmps: 36, nlps: 33, switch_mps: false },
  QeState { qeval: 0x0221, nmps: 37, nlps: 34, switch_mps: false },
  QeState { qeval: 0x0141, nmps: 38, nlps: 35, switch_mps: false },
  QeState { qeval: 0x0111, nmps: 39, nlps: 36, switch_mps: false },
  QeState { qeval: 0x0085, nmps: 40, nlps: 37, switch_mps: false },
  QeState { qeval: 0x0049, nmps: 41, nlps: 38, switch_mps: false },
  QeState { qeval: 0x0025, nmps: 42, nlps: 39, switch_mps: false },
  QeState { qeval: 0x0015, nmps: 43, nlps: 40, switch_mps: false },
  QeState { qeval: 0x0009, nmps: 44, nlps: 41, switch_mps: false },
  QeState { qeval: 0x0005, nmps: 45, nlps: 42, switch_mps: false },
  QeState { qeval: 0x0001, nmps: 45, nlps: 43, switch_mps: false },
  QeState { qeval: 0x5601, nmps: 46, nlps: 46, switch_mps: false },
];

/// Number of tier-1 contexts.
pub(crate) const NUM_CTXS: usize = 19;
/// Zero-coding contexts, 9 of them.
pub(crate) const CTX_ZC: u8 = 0;
/// Sign-coding contexts, 5 of them.
pub(crate) const CTX_SC: u8 = 9;
/// Magnitude-refinement contexts, 3 of them.
pub(crate) const CTX_MAG: u8 = 14;
/// Run-length (aggregation) context.
pub(crate) const CTX_AGG: u8 = 17;
/// Uniform context.
pub(crate) const CTX_UNI: u8 = 18;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CtxState {
  idx: u8,
  mps: u8,
}

fn initial_states() -> [CtxState; NUM_CTXS] {
  let mut ctxs = [CtxState::default(); NUM_CTXS];
  ctxs[CTX_UNI as usize].idx = 46;
  ctxs[CTX_AGG as usize].idx = 3;
  ctxs[CTX_ZC as usize].idx = 4;
  ctxs
}

/// MQ encoder writing into an owned buffer.
///
/// `out[0]` is a scratch byte standing in for the "byte before the
/// stream" that the carry-over rule may increment; emitted bytes start at
/// index 1.
pub(crate) struct MqEncoder {
  c: u32,
  a: u32,
  ct: u32,
  out: Vec<u8>,
  bp: usize,
  ctxs: [CtxState; NUM_CTXS],
  curctx: usize,
}

const START: usize = 1;

impl MqEncoder {
  pub fn new() -> Self {
    let mut enc = MqEncoder {
      c: 0,
      a: 0,
      ct: 0,
      out: vec![0u8],
      bp: 0,
      ctxs: initial_states(),
      curctx: 0,
    };
    enc.init();
    enc
  }

  fn init(&mut self) {
    self.a = 0x8000;
    self.c = 0;
    self.bp = 0;
    self.ct = 12;
  }

  pub fn reset_states(&mut self) {
    self.ctxs = initial_states();
  }

  pub fn set_ctx(&mut self, ctxno: u8) {
    self.curctx = ctxno as usize;
  }

  /// Bytes committed to the stream so far.
  pub fn numbytes(&self) -> u32 {
    (self.bp + 1).saturating_sub(START + 1) as u32
  }

  pub fn data(&self) -> &[u8] {
    &self.out[START..]
  }

  fn put(&mut self, b: u8) {
    if self.bp == self.out.len() {
      self.out.push(b);
    } else {
      self.out[self.bp] = b;
    }
  }

  fn byteout(&mut self) {
    if self.out[self.bp] == 0xff {
      self.bp += 1;
      let b = (self.c >> 20) as u8;
      self.put(b);
      self.c &= 0xfffff;
      self.ct = 7;
    } else if self.c & 0x800_0000 == 0 {
      self.bp += 1;
      let b = (self.c >> 19) as u8;
      self.put(b);
      self.c &= 0x7ffff;
      self.ct = 8;
    } else {
      self.out[self.bp] = self.out[self.bp].wrapping_add(1);
      if self.out[self.bp] == 0xff {
        self.c &= 0x7ff_ffff;
        self.bp += 1;
        let b = (self.c >> 20) as u8;
        self.put(b);
        self.c &= 0xfffff;
        self.ct = 7;
      } else {
        self.bp += 1;
        let b = (self.c >> 19) as u8;
        self.put(b);
        self.c &= 0x7ffff;
        self.ct = 8;
      }
    }
  }

  fn renorme(&mut self) {
    loop {
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.ct == 0 {
        self.byteout();
      }
      if self.a & 0x8000 != 0 {
        break;
      }
    }
  }

  fn codemps(&mut self) {
    let qe = QE[self.ctxs[self.curctx].idx as usize].qeval;
    self.a -= qe;
    if self.a & 0x8000 == 0 {
      if self.a < qe {
        self.a = qe;
      } else {
        self.c += qe;
      }
      self.ctxs[self.curctx].idx = QE[self.ctxs[self.curctx].idx as usize].nmps;
      self.renorme();
    } else {
      self.c += qe;
    }
  }

  fn codelps(&mut self) {
    let state = &QE[self.ctxs[self.curctx].idx as usize];
    let qe = state.qeval;
    self.a -= qe;
    if self.a < qe {
      self.c += qe;
    } else {
      self.a = qe;
    }
    if state.switch_mps {
      self.ctxs[self.curctx].mps = 1 - self.ctxs[self.curctx].mps;
    }
    self.ctxs[self.curctx].idx = state.nlps;
    self.renorme();
  }

  /// Encode one decision in the current context.
  pub fn encode(&mut self, d: u32) {
    if self.ctxs[self.curctx].mps == d as u8 {
      self.codemps();
    } else {
      self.codelps();
    }
  }

  fn setbits(&mut self) {
    let tempc = self.c + self.a;
    self.c |= 0xffff;
    if self.c >= tempc {
      self.c -= 0x8000;
    }
  }

  /// Standard flush; a trailing 0xFF is left uncounted.
  pub fn flush(&mut self) {
    self.setbits();
    self.c <<= self.ct;
    self.byteout();
    self.c <<= self.ct;
    self.byteout();
    if self.out[self.bp] != 0xff {
      self.bp += 1;
    }
  }

  /// Re-init after a terminated pass so coding continues past the flush.
  pub fn restart_init(&mut self) {
    self.a = 0x8000;
    self.c = 0;
    self.ct = 12;
    self.bp -= 1;
    if self.out[self.bp] == 0xff {
      self.ct = 13;
    }
  }

  /// Error-resilient termination (PTERM).
  pub fn erterm(&mut self) {
    let mut k = 11 - self.ct as i32 + 1;
    while k > 0 {
      self.c <<= self.ct;
      self.ct = 0;
      self.byteout();
      k -= self.ct as i32;
    }
    if self.out[self.bp] != 0xff {
      self.byteout();
    }
  }

  /// Four-symbol segmentation mark (1010 in the uniform context).
  pub fn segmark(&mut self) {
    self.set_ctx(CTX_UNI);
    for i in 1..5u32 {
      self.encode(i % 2);
    }
  }

  /// Switch to raw (bypass) byte emission after a terminated pass.
  pub fn bypass_init(&mut self) {
    self.c = 0;
    self.ct = 8;
    self.bp -= 1;
    if self.out[self.bp] == 0xff {
      self.ct = 7;
    }
  }

  pub fn bypass_put(&mut self, d: u32) {
    self.ct -= 1;
    self.c += (d & 1) << self.ct;
    if self.ct == 0 {
      self.bp += 1;
      let b = self.c as u8;
      self.put(b);
      self.ct = 8;
      if self.out[self.bp] == 0xff {
        self.ct = 7;
      }
      self.c = 0;
    }
  }

  /// Extra bytes a non-terminated raw pass may still need.
  pub fn bypass_extra_bytes(&self, erterm: bool) -> u32 {
    if self.ct < 7 || (self.ct == 7 && (erterm || self.out[self.bp] != 0xff)) {
      2
    } else {
      1
    }
  }

  /// Terminate a raw pass: pad the partial byte with alternating bits.
  /// A trailing 0xFF is dropped (the next segment overwrites it) unless
  /// predictable termination forbids the elimination.
  pub fn bypass_flush(&mut self, erterm: bool) {
    if self.ct < 7 || (self.ct == 7 && (erterm || self.out[self.bp] != 0xff)) {
      let mut bit_padding = 0u32;
      while self.ct > 0 {
        self.ct -= 1;
        self.c += bit_padding << self.ct;
        bit_padding = 1 - bit_padding;
      }
      self.bp += 1;
      let b = self.c as u8;
      self.put(b);
      // past the last byte, so numbytes() covers the whole pass
      self.bp += 1;
    } else if self.ct == 8 {
      self.bp += 1;
    }
    // ct == 7 with a trailing 0xff: leave it uncounted
    self.c = 0;
  }
}

/// MQ decoder over one borrowed segment.
pub(crate) struct MqDecoder<'a> {
  data: &'a [u8],
  bp: usize,
  c: u32,
  a: u32,
  ct: u32,
  pub ctxs: [CtxState; NUM_CTXS],
  curctx: usize,
}

impl<'a> MqDecoder<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    let c0 = if data.is_empty() { 0xff } else { data[0] as u32 };
    let mut dec = MqDecoder {
      data,
      bp: 0,
      c: c0 << 16,
      a: 0,
      ct: 0,
      ctxs: initial_states(),
      curctx: 0,
    };
    dec.bytein();
    dec.c <<= 7;
    dec.ct -= 7;
    dec.a = 0x8000;
    dec
  }

  /// Continue with fresh interval state but inherited contexts
  /// (segment boundary inside one codeblock).
  pub fn with_states(data: &'a [u8], ctxs: [CtxState; NUM_CTXS]) -> Self {
    let mut dec = MqDecoder::new(data);
    dec.ctxs = ctxs;
    dec
  }

  pub fn reset_states(&mut self) {
    self.ctxs = initial_states();
  }

  pub fn set_ctx(&mut self, ctxno: u8) {
    self.curctx = ctxno as usize;
  }

  fn bytein(&mut self) {
    if self.bp < self.data.len() {
      let next = if self.bp + 1 < self.data.len() {
        self.data[self.bp + 1] as u32
      } else {
        0xff
      };
      if self.data[self.bp] == 0xff {
        if next > 0x8f {
          // marker ahead: feed 1-bits
          self.c += 0xff00;
          self.ct = 8;
        } else {
          self.bp += 1;
          self.c += next << 9;
          self.ct = 7;
        }
      } else {
        self.bp += 1;
        self.c += next << 8;
        self.ct = 8;
      }
    } else {
      self.c += 0xff00;
      self.ct = 8;
    }
  }

  fn renormd(&mut self) {
    loop {
      if self.ct == 0 {
        self.bytein();
      }
      self.a <<= 1;
      self.c <<= 1;
      self.ct -= 1;
      if self.a & 0x8000 != 0 {
        break;
      }
    }
  }

  fn mps_exchange(&mut self) -> u32 {
    let state = &QE[self.ctxs[self.curctx].idx as usize];
    if self.a < state.qeval {
      let d = 1 - self.ctxs[self.curctx].mps as u32;
      if state.switch_mps {
        self.ctxs[self.curctx].mps = 1 - self.ctxs[self.curctx].mps;
      }
      self.ctxs[self.curctx].idx = state.nlps;
      d
    } else {
      let d = self.ctxs[self.curctx].mps as u32;
      self.ctxs[self.curctx].idx = state.nmps;
      d
    }
  }

  fn lps_exchange(&mut self) -> u32 {
    let state = &QE[self.ctxs[self.curctx].idx as usize];
    if self.a < state.qeval {
      self.a = state.qeval;
      let d = self.ctxs[self.curctx].mps as u32;
      self.ctxs[self.curctx].idx = state.nmps;
      d
    } else {
      self.a = state.qeval;
      let d = 1 - self.ctxs[self.curctx].mps as u32;
      if state.switch_mps {
        self.ctxs[self.curctx].mps = 1 - self.ctxs[self.curctx].mps;
      }
      self.ctxs[self.curctx].idx = state.nlps;
      d
    }
  }

  /// Decode one decision in the current context.
  pub fn decode(&mut self) -> u32 {
    let qe = QE[self.ctxs[self.curctx].idx as usize].qeval;
    self.a -= qe;
    if (self.c >> 16) < qe {
      let d = self.lps_exchange();
      self.renormd();
      d
    } else {
      self.c -= qe << 16;
      if self.a & 0x8000 == 0 {
        let d = self.mps_exchange();
        self.renormd();
        d
      } else {
        self.ctxs[self.curctx].mps as u32
      }
    }
  }
}

/// Raw bit reader for bypass segments.
pub(crate) struct RawDecoder<'a> {
  data: &'a [u8],
  len: usize,
  c: u32,
  ct: u32,
}

impl<'a> RawDecoder<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    RawDecoder { data, len: 0, c: 0, ct: 0 }
  }

  pub fn decode(&mut self) -> u32 {
    if self.ct == 0 {
      self.ct = 8;
      if self.len == self.data.len() {
        self.c = 0xff;
      } else {
        if self.c == 0xff {
          self.ct = 7;
        }
        self.c = self.data[self.len] as u32;
        self.len += 1;
      }
    }
    self.ct -= 1;
    (self.c >> self.ct) & 1
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip_bits(bits: &[u32], ctx_seq: &[u8]) {
    let mut enc = MqEncoder::new();
    for (i, &b) in bits.iter().enumerate() {
      enc.set_ctx(ctx_seq[i % ctx_seq.len()]);
      enc.encode(b);
    }
    enc.flush();
    let data = enc.data().to_vec();
    assert_eq!(data.len(), enc.numbytes() as usize + if data.last() == Some(&0xff) { 1 } else { 0 });

    let mut dec = MqDecoder::new(&data);
    for (i, &b) in bits.iter().enumerate() {
      dec.set_ctx(ctx_seq[i % ctx_seq.len()]);
      assert_eq!(dec.decode(), b, "bit {i}");
    }
  }

  #[test]
  fn roundtrip_uniform_context() {
    let bits: Vec<u32> = (0..256).map(|i| (i * 7 / 3) as u32 & 1).collect();
    roundtrip_bits(&bits, &[CTX_UNI]);
  }

  #[test]
  fn roundtrip_adaptive_contexts() {
    let mut seed = 0x9e3779b9u32;
    let bits: Vec<u32> = (0..2048)
      .map(|_| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        (seed >> 11) & 1
      })
      .collect();
    roundtrip_bits(&bits, &[CTX_ZC, CTX_ZC + 3, CTX_SC, CTX_MAG, CTX_AGG]);
  }

  #[test]
  fn roundtrip_skewed_stream() {
    // mostly-zero stream exercises the MPS path and carry handling
    let bits: Vec<u32> = (0..4096).map(|i| u32::from(i % 97 == 0)).collect();
    roundtrip_bits(&bits, &[CTX_ZC]);
  }

  #[test]
  fn raw_decoder_reads_msb_first() {
    let data = [0b1010_1100u8, 0xff, 0b0101_0101];
    let mut raw = RawDecoder::new(&data);
    let first: Vec<u32> = (0..8).map(|_| raw.decode()).collect();
    assert_eq!(first, vec![1, 0, 1, 0, 1, 1, 0, 0]);
    // after 0xff only seven bits of the next byte are payload
    let ff: Vec<u32> = (0..8).map(|_| raw.decode()).collect();
    assert_eq!(ff, vec![1; 8]);
    let third: Vec<u32> = (0..7).map(|_| raw.decode()).collect();
    assert_eq!(third, vec![1, 0, 1, 0, 1, 0, 1]);
  }

  #[test]
  fn segmark_decodes_as_1010() {
    let mut enc = MqEncoder::new();
    enc.segmark();
    enc.flush();
    let data = enc.data().to_vec();
    let mut dec = MqDecoder::new(&data);
    dec.set_ctx(CTX_UNI);
    for expected in [1u32, 0, 1, 0] {
      assert_eq!(dec.decode(), expected);
    }
  }
}
