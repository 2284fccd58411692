/*
 * The copyright in this software is being made available under the 2-clauses
 * BSD License, included below. This software may be subject to other third
 * party and contributor rights, including patent rights, and no such rights
 * are granted under this license.
 *
 * Copyright (c) 2002-2014, Universite catholique de Louvain (UCL), Belgium
 * Copyright (c) 2002-2014, Professor Benoit Macq
 * Copyright (c) 2001-2003, David Janssens
 * Copyright (c) 2002-2003, Yannick Verschueren
 * Copyright (c) 2003-2007, Francois-Olivier Devaux
 * Copyright (c) 2003-2014, Antonin Descampe
 * Copyright (c) 2005, Herve Drolon, FreeImage Team
 * Copyright (c) 2008, 2011-2012, Centre National d'Etudes Spatiales (CNES), FR
 * Copyright (c) 2012, CS Systemes d'Information, France
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

//! EBCOT tier-1: per-codeblock bit-plane coding through the MQ coder.
//!
//! Coefficients are scanned in four-row stripes; each bit plane below the
//! most significant one yields a significance-propagation pass, a
//! magnitude-refinement pass and a cleanup pass. The first coded pass is
//! the cleanup pass of the top non-zero plane.

use smallvec::SmallVec;

use crate::dwt;
use crate::error::{Error, Result};
use crate::math::floor_log2;
use crate::mqc::{CtxState, MqDecoder, MqEncoder, RawDecoder, CTX_AGG, CTX_MAG, CTX_SC, CTX_UNI, CTX_ZC};
use crate::params::CblkStyle;

pub(crate) const NMSEDEC_BITS: u32 = 7;
pub(crate) const NMSEDEC_FRACBITS: u32 = 6;

/* neighbourhood significance flags, one word per sample */
const SIG_NE: u16 = 0x0001;
const SIG_SE: u16 = 0x0002;
const SIG_SW: u16 = 0x0004;
const SIG_NW: u16 = 0x0008;
const SIG_N: u16 = 0x0010;
const SIG_E: u16 = 0x0020;
const SIG_S: u16 = 0x0040;
const SIG_W: u16 = 0x0080;
const SIG_OTH: u16 = 0x00ff;
const SGN_N: u16 = 0x0100;
const SGN_E: u16 = 0x0200;
const SGN_S: u16 = 0x0400;
const SGN_W: u16 = 0x0800;
const SIG: u16 = 0x1000;
const REFINE: u16 = 0x2000;
const VISIT: u16 = 0x4000;

const VSC_MASK: u16 = !(SIG_S | SIG_SE | SIG_SW | SGN_S);

/// One coding pass as recorded by the encoder.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Pass {
  /// Cumulative rate in bytes up to and including this pass.
  pub rate: u32,
  /// Cumulative distortion decrease.
  pub distortiondec: f64,
  /// Bytes added by this pass alone.
  pub len: u32,
  /// Pass ends with a terminated arithmetic segment.
  pub term: bool,
  /// ln(rate-distortion slope) in 8.8 fixed point; 0 = off the convex hull.
  pub slope: u16,
}

/// Encoder output for one codeblock.
#[derive(Debug, Default)]
pub(crate) struct CblkEncoded {
  pub numbps: u32,
  pub data: Vec<u8>,
  pub passes: SmallVec<[Pass; 16]>,
  /// Tile distortion contribution of this block.
  pub distortion: f64,
}

/// Scratch state reused across codeblocks of one worker.
pub(crate) struct T1 {
  pub w: u32,
  pub h: u32,
  pub data: Vec<i32>,
  flags: Vec<u16>,
  flags_stride: u32,
}

impl T1 {
  pub fn new() -> Self {
    T1 { w: 0, h: 0, data: Vec::new(), flags: Vec::new(), flags_stride: 0 }
  }

  pub fn resize(&mut self, w: u32, h: u32) {
    self.w = w;
    self.h = h;
    self.flags_stride = w + 2;
    self.data.clear();
    self.data.resize((w * h) as usize, 0);
    self.flags.clear();
    self.flags.resize((self.flags_stride * (h + 2)) as usize, 0);
  }

  #[inline]
  fn fidx(&self, x: u32, y: u32) -> usize {
    ((y + 1) * self.flags_stride + (x + 1)) as usize
  }

  #[inline]
  fn didx(&self, x: u32, y: u32) -> usize {
    (y * self.w + x) as usize
  }

  fn update_flags(&mut self, fi: usize, s: u32) {
    static MOD: [u16; 8] = [
      SIG_S, SIG_S | SGN_S,
      SIG_E, SIG_E | SGN_E,
      SIG_W, SIG_W | SGN_W,
      SIG_N, SIG_N | SGN_N,
    ];
    let stride = self.flags_stride as usize;
    let s = s as usize;
    self.flags[fi - stride - 1] |= SIG_SE;
    self.flags[fi - stride] |= MOD[s];
    self.flags[fi - stride + 1] |= SIG_SW;
    self.flags[fi - 1] |= MOD[s + 2];
    self.flags[fi] |= SIG;
    self.flags[fi + 1] |= MOD[s + 4];
    self.flags[fi + stride - 1] |= SIG_NE;
    self.flags[fi + stride] |= MOD[s + 6];
    self.flags[fi + stride + 1] |= SIG_NW;
  }
}

/* ----------------------------------------------------------------------- */
/* context modelling                                                       */

fn ctxno_zc(f: u16, orient: u32) -> u8 {
  let mut h = u32::from(f & SIG_W != 0) + u32::from(f & SIG_E != 0);
  let mut v = u32::from(f & SIG_N != 0) + u32::from(f & SIG_S != 0);
  let d = u32::from(f & SIG_NW != 0)
    + u32::from(f & SIG_NE != 0)
    + u32::from(f & SIG_SE != 0)
    + u32::from(f & SIG_SW != 0);
  let n;
  match orient {
    3 => {
      let hv = h + v;
      n = if d == 0 {
        match hv {
          0 => 0,
          1 => 1,
          _ => 2,
        }
      } else if d == 1 {
        match hv {
          0 => 3,
          1 => 4,
          _ => 5,
        }
      } else if d == 2 {
        if hv == 0 {
          6
        } else {
          7
        }
      } else {
        8
      };
    }
    _ => {
      if orient == 2 {
        core::mem::swap(&mut h, &mut v);
      }
      n = if h == 0 {
        if v == 0 {
          match d {
            0 => 0,
            1 => 1,
            _ => 2,
          }
        } else if v == 1 {
          3
        } else {
          4
        }
      } else if h == 1 {
        if v == 0 {
          if d == 0 {
            5
          } else {
            6
          }
        } else {
          7
        }
      } else {
        8
      };
    }
  }
  CTX_ZC + n as u8
}

fn sign_contribs(f: u16) -> (i32, i32) {
  let hc = (i32::from((f & (SIG_E | SGN_E)) == SIG_E) + i32::from((f & (SIG_W | SGN_W)) == SIG_W))
    .min(1)
    - (i32::from((f & (SIG_E | SGN_E)) == (SIG_E | SGN_E))
      + i32::from((f & (SIG_W | SGN_W)) == (SIG_W | SGN_W)))
    .min(1);
  let vc = (i32::from((f & (SIG_N | SGN_N)) == SIG_N) + i32::from((f & (SIG_S | SGN_S)) == SIG_S))
    .min(1)
    - (i32::from((f & (SIG_N | SGN_N)) == (SIG_N | SGN_N))
      + i32::from((f & (SIG_S | SGN_S)) == (SIG_S | SGN_S)))
    .min(1);
  (hc, vc)
}

fn ctxno_sc(f: u16) -> u8 {
  let (mut hc, mut vc) = sign_contribs(f);
  if hc < 0 {
    hc = -hc;
    vc = -vc;
  }
  let n = if hc == 0 {
    if vc == 0 {
      0
    } else {
      1
    }
  } else {
    match vc {
      -1 => 2,
      0 => 3,
      _ => 4,
    }
  };
  CTX_SC + n
}

/// Sign-prediction bit XORed with the coded sign decision.
fn spb(f: u16) -> u32 {
  let (hc, vc) = sign_contribs(f);
  if hc == 0 && vc == 0 {
    0
  } else {
    u32::from(!(hc > 0 || (hc == 0 && vc > 0)))
  }
}

fn ctxno_mag(f: u16) -> u8 {
  let n = if f & REFINE == 0 {
    u8::from(f & SIG_OTH != 0)
  } else {
    2
  };
  CTX_MAG + n
}

/* ----------------------------------------------------------------------- */
/* distortion estimates                                                    */

fn nmsedec_fix(u: f64, v: f64) -> i32 {
  let frac = f64::from(1u32 << NMSEDEC_FRACBITS);
  (((u * u - v * v) * frac + 0.5).floor() / frac * 8192.0).max(0.0) as i32
}

fn nmsedec_sig(x: u32, bitpos: u32) -> i32 {
  let i = if bitpos > 0 { x >> bitpos } else { x } & ((1 << NMSEDEC_BITS) - 1);
  let t = f64::from(i) / f64::from(1u32 << NMSEDEC_FRACBITS);
  if bitpos > 0 {
    nmsedec_fix(t, t - 1.5)
  } else {
    nmsedec_fix(t, t - 1.0)
  }
}

fn nmsedec_ref(x: u32, bitpos: u32) -> i32 {
  let i = if bitpos > 0 { x >> bitpos } else { x } & ((1 << NMSEDEC_BITS) - 1);
  let t = f64::from(i) / f64::from(1u32 << NMSEDEC_FRACBITS);
  if bitpos > 0 {
    let v = if i & (1 << (NMSEDEC_BITS - 1)) != 0 { t - 1.5 } else { t - 0.5 };
    nmsedec_fix(t - 1.0, v)
  } else {
    nmsedec_fix(t - 1.0, t - 0.5)
  }
}

fn wmsedec(
  nmsedec: i32,
  compno: u32,
  level: u32,
  orient: u32,
  bpno: i32,
  qmfbid: u32,
  stepsize: f64,
  mct_norms: Option<&[f64]>,
) -> f64 {
  let w1 = match mct_norms {
    Some(norms) if (compno as usize) < norms.len() => norms[compno as usize],
    _ => 1.0,
  };
  let w2 = if qmfbid == 1 {
    dwt::getnorm(level, orient)
  } else {
    dwt::getnorm_real(level, orient)
  };
  let mut w = w1 * w2 * stepsize * f64::from(1u32 << bpno);
  w *= w * f64::from(nmsedec) / 8192.0;
  w
}

/* ----------------------------------------------------------------------- */
/* encoder passes                                                          */

fn enc_sigpass(
  t1: &mut T1,
  mqc: &mut MqEncoder,
  bpno: i32,
  orient: u32,
  raw: bool,
  cblksty: CblkStyle,
) -> i32 {
  let mut nmsedec = 0i32;
  let one = 1i32 << (bpno + NMSEDEC_FRACBITS as i32);
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & SIG_OTH != 0 && flag & (SIG | VISIT) == 0 {
          let datum = t1.data[t1.didx(i, j)];
          let v = u32::from(datum.unsigned_abs() as i32 & one != 0);
          if raw {
            mqc.bypass_put(v);
          } else {
            mqc.set_ctx(ctxno_zc(flag, orient));
            mqc.encode(v);
          }
          if v != 0 {
            let s = u32::from(datum < 0);
            nmsedec += nmsedec_sig(datum.unsigned_abs(), (bpno + NMSEDEC_FRACBITS as i32) as u32);
            if raw {
              mqc.bypass_put(s);
            } else {
              mqc.set_ctx(ctxno_sc(flag));
              mqc.encode(s ^ spb(flag));
            }
            t1.update_flags(fi, s);
          }
          t1.flags[fi] |= VISIT;
        }
      }
    }
    k += 4;
  }
  nmsedec
}

fn enc_refpass(t1: &mut T1, mqc: &mut MqEncoder, bpno: i32, raw: bool, cblksty: CblkStyle) -> i32 {
  let mut nmsedec = 0i32;
  let one = 1i32 << (bpno + NMSEDEC_FRACBITS as i32);
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & (SIG | VISIT) == SIG {
          let datum = t1.data[t1.didx(i, j)];
          nmsedec += nmsedec_ref(datum.unsigned_abs(), (bpno + NMSEDEC_FRACBITS as i32) as u32);
          let v = u32::from(datum.unsigned_abs() as i32 & one != 0);
          if raw {
            mqc.bypass_put(v);
          } else {
            mqc.set_ctx(ctxno_mag(flag));
            mqc.encode(v);
          }
          t1.flags[fi] |= REFINE;
        }
      }
    }
    k += 4;
  }
  nmsedec
}

fn enc_clnpass(t1: &mut T1, mqc: &mut MqEncoder, bpno: i32, orient: u32, cblksty: CblkStyle) -> i32 {
  let mut nmsedec = 0i32;
  let one = 1i32 << (bpno + NMSEDEC_FRACBITS as i32);
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      let agg = if k + 3 < t1.h {
        let last = if vsc_mode {
          t1.flags[t1.fidx(i, k + 3)] & VSC_MASK
        } else {
          t1.flags[t1.fidx(i, k + 3)]
        };
        (t1.flags[t1.fidx(i, k)]
          | t1.flags[t1.fidx(i, k + 1)]
          | t1.flags[t1.fidx(i, k + 2)])
          & (SIG | VISIT | SIG_OTH)
          == 0
          && last & (SIG | VISIT | SIG_OTH) == 0
      } else {
        false
      };
      let mut runlen = 0u32;
      if agg {
        runlen = 4;
        for r in 0..4u32 {
          if t1.data[t1.didx(i, k + r)].unsigned_abs() as i32 & one != 0 {
            runlen = r;
            break;
          }
        }
        mqc.set_ctx(CTX_AGG);
        mqc.encode(u32::from(runlen != 4));
        if runlen == 4 {
          continue;
        }
        mqc.set_ctx(CTX_UNI);
        mqc.encode(runlen >> 1);
        mqc.encode(runlen & 1);
      }
      for j in (k + runlen)..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let partial = agg && j == k + runlen;
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        let datum = t1.data[t1.didx(i, j)];
        if !partial {
          if t1.flags[fi] & (SIG | VISIT) != 0 {
            t1.flags[fi] &= !VISIT;
            continue;
          }
          mqc.set_ctx(ctxno_zc(flag, orient));
          let v = u32::from(datum.unsigned_abs() as i32 & one != 0);
          mqc.encode(v);
          if v == 0 {
            t1.flags[fi] &= !VISIT;
            continue;
          }
        }
        // significance established: code the sign
        nmsedec += nmsedec_sig(datum.unsigned_abs(), (bpno + NMSEDEC_FRACBITS as i32) as u32);
        mqc.set_ctx(ctxno_sc(flag));
        let s = u32::from(datum < 0);
        mqc.encode(s ^ spb(flag));
        t1.update_flags(fi, s);
        t1.flags[fi] &= !VISIT;
      }
    }
    k += 4;
  }
  nmsedec
}

fn is_term_pass(numbps: u32, cblksty: CblkStyle, bpno: i32, passtype: u32) -> bool {
  if passtype == 2 && bpno == 0 {
    return true;
  }
  if cblksty.contains(CblkStyle::TERMALL) {
    return true;
  }
  if cblksty.contains(CblkStyle::LAZY) {
    if bpno == numbps as i32 - 4 && passtype == 2 {
      return true;
    }
    if bpno < numbps as i32 - 4 && passtype > 0 {
      return true;
    }
  }
  false
}

/// Encode one codeblock. `t1.data` holds the quantised coefficients
/// (already up-shifted by [`NMSEDEC_FRACBITS`] and any ROI shift).
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_cblk(
  t1: &mut T1,
  orient: u32,
  compno: u32,
  level: u32,
  qmfbid: u32,
  stepsize: f64,
  cblksty: CblkStyle,
  mct_norms: Option<&[f64]>,
) -> CblkEncoded {
  let mut out = CblkEncoded::default();

  let mut max = 0i32;
  for &v in &t1.data {
    max = max.max(v.unsigned_abs().min(i32::MAX as u32) as i32);
  }
  out.numbps = if max != 0 {
    (floor_log2(max as u32) + 1).saturating_sub(NMSEDEC_FRACBITS)
  } else {
    0
  };
  if out.numbps == 0 {
    return out;
  }

  let mut mqc = MqEncoder::new();
  let mut bpno = out.numbps as i32 - 1;
  let mut passtype = 2u32;
  let mut cumwmsedec = 0.0f64;

  while bpno >= 0 {
    let raw =
      bpno < out.numbps as i32 - 4 && passtype < 2 && cblksty.contains(CblkStyle::LAZY);
    if let Some(prev) = out.passes.last() {
      if prev.term {
        if raw {
          mqc.bypass_init();
        } else {
          mqc.restart_init();
        }
      }
    }
    let nmsedec = match passtype {
      0 => enc_sigpass(t1, &mut mqc, bpno, orient, raw, cblksty),
      1 => enc_refpass(t1, &mut mqc, bpno, raw, cblksty),
      _ => {
        let n = enc_clnpass(t1, &mut mqc, bpno, orient, cblksty);
        if cblksty.contains(CblkStyle::SEGSYM) {
          mqc.segmark();
        }
        n
      }
    };
    cumwmsedec += wmsedec(nmsedec, compno, level, orient, bpno, qmfbid, stepsize, mct_norms);

    let mut pass = Pass {
      distortiondec: cumwmsedec,
      ..Pass::default()
    };
    if is_term_pass(out.numbps, cblksty, bpno, passtype) {
      if raw {
        mqc.bypass_flush(cblksty.contains(CblkStyle::PTERM));
      } else if cblksty.contains(CblkStyle::PTERM) {
        mqc.erterm();
      } else {
        mqc.flush();
      }
      pass.term = true;
      pass.rate = mqc.numbytes();
    } else {
      let extra = if raw {
        mqc.bypass_extra_bytes(cblksty.contains(CblkStyle::PTERM))
      } else {
        3
      };
      pass.term = false;
      pass.rate = mqc.numbytes() + extra;
    }
    out.passes.push(pass);

    passtype += 1;
    if passtype == 3 {
      passtype = 0;
      bpno -= 1;
    }
    if cblksty.contains(CblkStyle::RESET) {
      mqc.reset_states();
    }
  }

  // pass rates must be non-decreasing and bounded by the flushed stream
  let mut last_rate = mqc.numbytes();
  for pass in out.passes.iter_mut().rev() {
    if pass.rate > last_rate {
      pass.rate = last_rate;
    } else {
      last_rate = pass.rate;
    }
  }

  out.data = mqc.data().to_vec();
  let mut prev_rate = 0u32;
  for pass in out.passes.iter_mut() {
    // a pass must never end on an 0xFF byte
    debug_assert!(pass.rate > 0);
    if pass.rate > 0 && out.data.get(pass.rate as usize - 1) == Some(&0xff) {
      pass.rate -= 1;
    }
    pass.len = pass.rate - prev_rate;
    prev_rate = pass.rate;
  }
  out.data.truncate(prev_rate as usize);
  out.distortion = cumwmsedec;
  out
}

/* ----------------------------------------------------------------------- */
/* decoder passes                                                          */

enum Coder<'a> {
  Mq(MqDecoder<'a>),
  Raw(RawDecoder<'a>),
}

fn dec_sigpass_mq(t1: &mut T1, mqc: &mut MqDecoder<'_>, p: i32, orient: u32, cblksty: CblkStyle) {
  let one = 1i32 << p;
  let half = one >> 1;
  let oneplushalf = one | half;
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & SIG_OTH != 0 && flag & (SIG | VISIT) == 0 {
          mqc.set_ctx(ctxno_zc(flag, orient));
          if mqc.decode() != 0 {
            mqc.set_ctx(ctxno_sc(flag));
            let v = mqc.decode() ^ spb(flag);
            let di = t1.didx(i, j);
            t1.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
            t1.update_flags(fi, v);
          }
          t1.flags[fi] |= VISIT;
        }
      }
    }
    k += 4;
  }
}

fn dec_sigpass_raw(t1: &mut T1, raw: &mut RawDecoder<'_>, p: i32, cblksty: CblkStyle) {
  let one = 1i32 << p;
  let half = one >> 1;
  let oneplushalf = one | half;
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & SIG_OTH != 0 && flag & (SIG | VISIT) == 0 {
          if raw.decode() != 0 {
            let v = raw.decode();
            let di = t1.didx(i, j);
            t1.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
            t1.update_flags(fi, v);
          }
          t1.flags[fi] |= VISIT;
        }
      }
    }
    k += 4;
  }
}

fn dec_refpass_mq(t1: &mut T1, mqc: &mut MqDecoder<'_>, p: i32, cblksty: CblkStyle) {
  let one = 1i32 << p;
  let poshalf = one >> 1;
  let neghalf = if p > 0 { -poshalf } else { -1 };
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & (SIG | VISIT) == SIG {
          mqc.set_ctx(ctxno_mag(flag));
          let v = mqc.decode();
          let t = if v != 0 { poshalf } else { neghalf };
          let di = t1.didx(i, j);
          let cur = t1.data[di];
          t1.data[di] = cur + if cur < 0 { -t } else { t };
          t1.flags[fi] |= REFINE;
        }
      }
    }
    k += 4;
  }
}

fn dec_refpass_raw(t1: &mut T1, raw: &mut RawDecoder<'_>, p: i32, cblksty: CblkStyle) {
  let one = 1i32 << p;
  let poshalf = one >> 1;
  let neghalf = if p > 0 { -poshalf } else { -1 };
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      for j in k..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if flag & (SIG | VISIT) == SIG {
          let v = raw.decode();
          let t = if v != 0 { poshalf } else { neghalf };
          let di = t1.didx(i, j);
          let cur = t1.data[di];
          t1.data[di] = cur + if cur < 0 { -t } else { t };
          t1.flags[fi] |= REFINE;
        }
      }
    }
    k += 4;
  }
}

fn dec_clnpass(t1: &mut T1, mqc: &mut MqDecoder<'_>, p: i32, orient: u32, cblksty: CblkStyle) {
  let one = 1i32 << p;
  let half = one >> 1;
  let oneplushalf = one | half;
  let vsc_mode = cblksty.contains(CblkStyle::VSC);
  let mut k = 0;
  while k < t1.h {
    for i in 0..t1.w {
      let agg = if k + 3 < t1.h {
        let last = if vsc_mode {
          t1.flags[t1.fidx(i, k + 3)] & VSC_MASK
        } else {
          t1.flags[t1.fidx(i, k + 3)]
        };
        (t1.flags[t1.fidx(i, k)]
          | t1.flags[t1.fidx(i, k + 1)]
          | t1.flags[t1.fidx(i, k + 2)])
          & (SIG | VISIT | SIG_OTH)
          == 0
          && last & (SIG | VISIT | SIG_OTH) == 0
      } else {
        false
      };
      let mut runlen = 0u32;
      if agg {
        mqc.set_ctx(CTX_AGG);
        if mqc.decode() == 0 {
          continue;
        }
        mqc.set_ctx(CTX_UNI);
        runlen = mqc.decode();
        runlen = (runlen << 1) | mqc.decode();
      }
      for j in (k + runlen)..(k + 4).min(t1.h) {
        let vsc = vsc_mode && (j == k + 3 || j == t1.h - 1);
        let partial = agg && j == k + runlen;
        let fi = t1.fidx(i, j);
        let flag = if vsc { t1.flags[fi] & VSC_MASK } else { t1.flags[fi] };
        if !partial {
          if flag & (SIG | VISIT) != 0 {
            t1.flags[fi] &= !VISIT;
            continue;
          }
          mqc.set_ctx(ctxno_zc(flag, orient));
          if mqc.decode() == 0 {
            t1.flags[fi] &= !VISIT;
            continue;
          }
        }
        mqc.set_ctx(ctxno_sc(flag));
        let v = mqc.decode() ^ spb(flag);
        let di = t1.didx(i, j);
        t1.data[di] = if v != 0 { -oneplushalf } else { oneplushalf };
        t1.update_flags(fi, v);
        t1.flags[fi] &= !VISIT;
      }
    }
    k += 4;
  }
  if cblksty.contains(CblkStyle::SEGSYM) {
    mqc.set_ctx(CTX_UNI);
    let mut v = mqc.decode();
    v = (v << 1) | mqc.decode();
    v = (v << 1) | mqc.decode();
    v = (v << 1) | mqc.decode();
    if v != 0xa {
      log::warn!("bad segmentation symbol {v:#x}; stream may be corrupted");
    }
  }
}

/// Decode one codeblock from its segments into `t1.data` (magnitudes at
/// twice the quantised scale, plus the half-bit).
pub(crate) fn decode_cblk(
  t1: &mut T1,
  w: u32,
  h: u32,
  numbps: u32,
  orient: u32,
  cblksty: CblkStyle,
  segments: &[(&[u8], u32)],
) -> Result<()> {
  t1.resize(w, h);
  if numbps == 0 {
    return Ok(());
  }
  if numbps > 30 {
    return Err(Error::CorruptCodeblock(format!(
      "implausible bit-plane count {numbps}"
    )));
  }

  let mut bpno = numbps as i32 - 1;
  let mut passtype = 2u32;
  let mut saved_ctxs: Option<[CtxState; crate::mqc::NUM_CTXS]> = None;

  for &(segdata, numpasses) in segments {
    let raw_seg = bpno < numbps as i32 - 4 && passtype < 2 && cblksty.contains(CblkStyle::LAZY);
    let mut coder = if raw_seg {
      Coder::Raw(RawDecoder::new(segdata))
    } else {
      match saved_ctxs {
        Some(ctxs) => Coder::Mq(MqDecoder::with_states(segdata, ctxs)),
        None => Coder::Mq(MqDecoder::new(segdata)),
      }
    };
    for _ in 0..numpasses {
      if bpno < 0 {
        return Err(Error::CorruptCodeblock(
          "more coding passes than bit planes".into(),
        ));
      }
      match &mut coder {
        Coder::Mq(mqc) => match passtype {
          0 => dec_sigpass_mq(t1, mqc, bpno + 1, orient, cblksty),
          1 => dec_refpass_mq(t1, mqc, bpno + 1, cblksty),
          _ => dec_clnpass(t1, mqc, bpno + 1, orient, cblksty),
        },
        Coder::Raw(raw) => match passtype {
          0 => dec_sigpass_raw(t1, raw, bpno + 1, cblksty),
          1 => dec_refpass_raw(t1, raw, bpno + 1, cblksty),
          _ => {
            return Err(Error::CorruptCodeblock(
              "cleanup pass inside a raw segment".into(),
            ))
          }
        },
      }
      if cblksty.contains(CblkStyle::RESET) {
        if let Coder::Mq(mqc) = &mut coder {
          mqc.reset_states();
        }
      }
      passtype += 1;
      if passtype == 3 {
        passtype = 0;
        bpno -= 1;
      }
    }
    if let Coder::Mq(mqc) = coder {
      saved_ctxs = Some(mqc.ctxs);
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fill_t1(t1: &mut T1, w: u32, h: u32, coeffs: &[i32]) {
    t1.resize(w, h);
    for (d, &c) in t1.data.iter_mut().zip(coeffs) {
      *d = c << NMSEDEC_FRACBITS;
    }
  }

  fn segments_for(encoded: &CblkEncoded) -> Vec<(usize, u32)> {
    // default mode: one segment covering every pass
    vec![(encoded.data.len(), encoded.passes.len() as u32)]
  }

  fn roundtrip(w: u32, h: u32, coeffs: &[i32], orient: u32, cblksty: CblkStyle) {
    let mut t1 = T1::new();
    fill_t1(&mut t1, w, h, coeffs);
    let encoded = encode_cblk(&mut t1, orient, 0, 0, 1, 1.0, cblksty, None);

    let mut dec = T1::new();
    let segs: Vec<(&[u8], u32)> = segments_for(&encoded)
      .into_iter()
      .map(|(len, np)| (&encoded.data[..len], np))
      .collect();
    decode_cblk(&mut dec, w, h, encoded.numbps, orient, cblksty, &segs).unwrap();

    for (idx, &orig) in coeffs.iter().enumerate() {
      let rec = dec.data[idx] / 2;
      assert_eq!(rec, orig, "coefficient {idx}");
    }
  }

  #[test]
  fn zero_block_emits_no_passes() {
    let mut t1 = T1::new();
    fill_t1(&mut t1, 8, 8, &[0; 64]);
    let encoded = encode_cblk(&mut t1, 0, 0, 0, 1, 1.0, CblkStyle::empty(), None);
    assert_eq!(encoded.numbps, 0);
    assert!(encoded.passes.is_empty());
    assert!(encoded.data.is_empty());
  }

  #[test]
  fn single_coefficient_roundtrip() {
    let mut coeffs = vec![0i32; 16];
    coeffs[5] = 7;
    roundtrip(4, 4, &coeffs, 0, CblkStyle::empty());
  }

  #[test]
  fn dense_block_roundtrip_all_orients() {
    let coeffs: Vec<i32> = (0..256)
      .map(|i| {
        let v = ((i * 2654435761u64 as usize) >> 24) as i32 % 181;
        if i % 3 == 0 {
          -v
        } else {
          v
        }
      })
      .collect();
    for orient in 0..4 {
      roundtrip(16, 16, &coeffs, orient, CblkStyle::empty());
    }
  }

  #[test]
  fn non_square_block_roundtrip() {
    let coeffs: Vec<i32> = (0..33 * 5).map(|i| (i as i32 % 23) - 11).collect();
    roundtrip(33, 5, &coeffs, 1, CblkStyle::empty());
  }

  #[test]
  fn stripe_tail_roundtrip() {
    // height not a multiple of the 4-row stripe
    let coeffs: Vec<i32> = (0..7 * 7).map(|i| (i as i32 * 5 % 64) - 32).collect();
    roundtrip(7, 7, &coeffs, 2, CblkStyle::empty());
  }

  #[test]
  fn segsym_roundtrip() {
    let coeffs: Vec<i32> = (0..64).map(|i| (i as i32 % 9) - 4).collect();
    roundtrip(8, 8, &coeffs, 0, CblkStyle::SEGSYM);
  }

  #[test]
  fn vsc_roundtrip() {
    let coeffs: Vec<i32> = (0..16 * 12).map(|i| (i as i32 % 31) - 15).collect();
    roundtrip(16, 12, &coeffs, 0, CblkStyle::VSC);
  }

  #[test]
  fn reset_roundtrip() {
    let coeffs: Vec<i32> = (0..64).map(|i| (i as i32 % 17) - 8).collect();
    roundtrip(8, 8, &coeffs, 3, CblkStyle::RESET);
  }

  #[test]
  fn termall_roundtrip_with_per_pass_segments() {
    let coeffs: Vec<i32> = (0..64).map(|i| (i as i32 % 13) - 6).collect();
    let mut t1 = T1::new();
    fill_t1(&mut t1, 8, 8, &coeffs);
    let encoded = encode_cblk(&mut t1, 0, 0, 0, 1, 1.0, CblkStyle::TERMALL, None);
    assert!(encoded.passes.iter().all(|p| p.term));

    // every pass is its own segment
    let mut dec = T1::new();
    let mut segs: Vec<(&[u8], u32)> = Vec::new();
    let mut start = 0usize;
    for pass in &encoded.passes {
      segs.push((&encoded.data[start..pass.rate as usize], 1));
      start = pass.rate as usize;
    }
    decode_cblk(&mut dec, 8, 8, encoded.numbps, 0, CblkStyle::TERMALL, &segs).unwrap();
    for (idx, &orig) in coeffs.iter().enumerate() {
      assert_eq!(dec.data[idx] / 2, orig, "coefficient {idx}");
    }
  }

  #[test]
  fn pass_rates_are_monotonic() {
    let coeffs: Vec<i32> = (0..1024).map(|i| ((i * 31) % 257) as i32 - 128).collect();
    let mut t1 = T1::new();
    fill_t1(&mut t1, 32, 32, &coeffs);
    let encoded = encode_cblk(&mut t1, 0, 0, 0, 1, 1.0, CblkStyle::empty(), None);
    let mut prev = 0;
    for pass in &encoded.passes {
      assert!(pass.rate >= prev);
      prev = pass.rate;
    }
    assert_eq!(prev as usize, encoded.data.len());
    // distortion decreases accumulate
    let mut prev_d = 0.0;
    for pass in &encoded.passes {
      assert!(pass.distortiondec >= prev_d);
      prev_d = pass.distortiondec;
    }
  }

  #[test]
  fn truncated_decode_is_clean() {
    let coeffs: Vec<i32> = (0..256).map(|i| ((i * 7) % 127) as i32 - 63).collect();
    let mut t1 = T1::new();
    fill_t1(&mut t1, 16, 16, &coeffs);
    let encoded = encode_cblk(&mut t1, 0, 0, 0, 1, 1.0, CblkStyle::empty(), None);
    // keep only the first three passes
    if encoded.passes.len() > 3 {
      let rate = encoded.passes[2].rate as usize;
      let mut dec = T1::new();
      decode_cblk(
        &mut dec,
        16,
        16,
        encoded.numbps,
        0,
        CblkStyle::empty(),
        &[(&encoded.data[..rate], 3)],
      )
      .unwrap();
      // truncation must still produce bounded magnitudes
      for &v in &dec.data {
        assert!(v.unsigned_abs() < 1 << (encoded.numbps + 2));
      }
    }
  }
}
