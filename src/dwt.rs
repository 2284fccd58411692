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

//! Discrete wavelet transform: reversible 5/3 and irreversible 9/7
//! lifting with symmetric extension, applied level by level over the
//! resolution pyramid. The 9/7 path runs in 13-bit fixed point on
//! samples carrying 11 fractional bits.

use crate::math::fix_mul;
use crate::params::{QuantStyle, StepSize, Tccp};

/// Extents of one resolution level.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResRect {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
}

impl ResRect {
  pub fn w(&self) -> u32 {
    self.x1 - self.x0
  }

  pub fn h(&self) -> u32 {
    self.y1 - self.y0
  }
}

/* ----------------------------------------------------------------------- */
/* 1-D lifting on an interleaved buffer                                    */
/* layout: a[2i] = even samples, a[2i+1] = odd samples                     */

#[inline]
fn ev(a: &[i32], i: i32) -> i32 {
  a[(2 * i) as usize]
}

#[inline]
fn od(a: &[i32], i: i32) -> i32 {
  a[(1 + 2 * i) as usize]
}

/* symmetric extension accessors; `n` is the count of the slot's samples */
#[inline]
fn ev_x(a: &[i32], i: i32, n: i32) -> i32 {
  ev(a, i.clamp(0, n - 1))
}

#[inline]
fn od_x(a: &[i32], i: i32, n: i32) -> i32 {
  od(a, i.clamp(0, n - 1))
}

fn encode_1_53(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
  if cas == 0 {
    if dn > 0 || sn > 1 {
      for i in 0..dn {
        let t = (ev_x(a, i, sn) + ev_x(a, i + 1, sn)) >> 1;
        a[(1 + 2 * i) as usize] -= t;
      }
      for i in 0..sn {
        let t = (od_x(a, i - 1, dn) + od_x(a, i, dn) + 2) >> 2;
        a[(2 * i) as usize] += t;
      }
    }
  } else if sn == 0 && dn == 1 {
    a[0] *= 2;
  } else {
    // odd origin: even slots hold the high-pass samples
    for i in 0..dn {
      let t = (od_x(a, i, sn) + od_x(a, i - 1, sn)) >> 1;
      a[(2 * i) as usize] -= t;
    }
    for i in 0..sn {
      let t = (ev_x(a, i, dn) + ev_x(a, i + 1, dn) + 2) >> 2;
      a[(1 + 2 * i) as usize] += t;
    }
  }
}

fn decode_1_53(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
  if cas == 0 {
    if dn > 0 || sn > 1 {
      for i in 0..sn {
        let t = (od_x(a, i - 1, dn) + od_x(a, i, dn) + 2) >> 2;
        a[(2 * i) as usize] -= t;
      }
      for i in 0..dn {
        let t = (ev_x(a, i, sn) + ev_x(a, i + 1, sn)) >> 1;
        a[(1 + 2 * i) as usize] += t;
      }
    }
  } else if sn == 0 && dn == 1 {
    a[0] /= 2;
  } else {
    for i in 0..sn {
      let t = (ev_x(a, i, dn) + ev_x(a, i + 1, dn) + 2) >> 2;
      a[(1 + 2 * i) as usize] -= t;
    }
    for i in 0..dn {
      let t = (od_x(a, i, sn) + od_x(a, i - 1, sn)) >> 1;
      a[(2 * i) as usize] += t;
    }
  }
}

/* 9/7 lifting constants, 13-bit fixed point:
   12993 ~ alpha, 434 ~ beta, 7233 ~ gamma, 3633 ~ delta,
   5038 ~ K/2, 6659 ~ 1/K, 10078 ~ K, 13318 ~ 2/K */

fn encode_1_97(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
  if cas == 0 {
    if dn > 0 || sn > 1 {
      for i in 0..dn {
        let t = fix_mul(ev_x(a, i, sn) + ev_x(a, i + 1, sn), 12993);
        a[(1 + 2 * i) as usize] -= t;
      }
      for i in 0..sn {
        let t = fix_mul(od_x(a, i - 1, dn) + od_x(a, i, dn), 434);
        a[(2 * i) as usize] -= t;
      }
      for i in 0..dn {
        let t = fix_mul(ev_x(a, i, sn) + ev_x(a, i + 1, sn), 7233);
        a[(1 + 2 * i) as usize] += t;
      }
      for i in 0..sn {
        let t = fix_mul(od_x(a, i - 1, dn) + od_x(a, i, dn), 3633);
        a[(2 * i) as usize] += t;
      }
      for i in 0..dn {
        let t = fix_mul(od(a, i), 5038);
        a[(1 + 2 * i) as usize] = t;
      }
      for i in 0..sn {
        let t = fix_mul(ev(a, i), 6659);
        a[(2 * i) as usize] = t;
      }
    }
  } else if sn > 0 || dn > 1 {
    for i in 0..dn {
      let t = fix_mul(od_x(a, i, sn) + od_x(a, i - 1, sn), 12993);
      a[(2 * i) as usize] -= t;
    }
    for i in 0..sn {
      let t = fix_mul(ev_x(a, i, dn) + ev_x(a, i + 1, dn), 434);
      a[(1 + 2 * i) as usize] -= t;
    }
    for i in 0..dn {
      let t = fix_mul(od_x(a, i, sn) + od_x(a, i - 1, sn), 7233);
      a[(2 * i) as usize] += t;
    }
    for i in 0..sn {
      let t = fix_mul(ev_x(a, i, dn) + ev_x(a, i + 1, dn), 3633);
      a[(1 + 2 * i) as usize] += t;
    }
    for i in 0..dn {
      let t = fix_mul(ev(a, i), 5038);
      a[(2 * i) as usize] = t;
    }
    for i in 0..sn {
      let t = fix_mul(od(a, i), 6659);
      a[(1 + 2 * i) as usize] = t;
    }
  }
}

fn decode_1_97(a: &mut [i32], dn: i32, sn: i32, cas: i32) {
  if cas == 0 {
    if dn > 0 || sn > 1 {
      for i in 0..sn {
        let t = fix_mul(ev(a, i), 10078);
        a[(2 * i) as usize] = t;
      }
      for i in 0..dn {
        let t = fix_mul(od(a, i), 13318);
        a[(1 + 2 * i) as usize] = t;
      }
      for i in 0..sn {
        let t = fix_mul(od_x(a, i - 1, dn) + od_x(a, i, dn), 3633);
        a[(2 * i) as usize] -= t;
      }
      for i in 0..dn {
        let t = fix_mul(ev_x(a, i, sn) + ev_x(a, i + 1, sn), 7233);
        a[(1 + 2 * i) as usize] -= t;
      }
      for i in 0..sn {
        let t = fix_mul(od_x(a, i - 1, dn) + od_x(a, i, dn), 434);
        a[(2 * i) as usize] += t;
      }
      for i in 0..dn {
        let t = fix_mul(ev_x(a, i, sn) + ev_x(a, i + 1, sn), 12993);
        a[(1 + 2 * i) as usize] += t;
      }
    }
  } else if sn > 0 || dn > 1 {
    for i in 0..sn {
      let t = fix_mul(od(a, i), 10078);
      a[(1 + 2 * i) as usize] = t;
    }
    for i in 0..dn {
      let t = fix_mul(ev(a, i), 13318);
      a[(2 * i) as usize] = t;
    }
    for i in 0..sn {
      let t = fix_mul(ev_x(a, i, dn) + ev_x(a, i + 1, dn), 3633);
      a[(1 + 2 * i) as usize] -= t;
    }
    for i in 0..dn {
      let t = fix_mul(od_x(a, i, sn) + od_x(a, i - 1, sn), 7233);
      a[(2 * i) as usize] -= t;
    }
    for i in 0..sn {
      let t = fix_mul(ev_x(a, i, dn) + ev_x(a, i + 1, dn), 434);
      a[(1 + 2 * i) as usize] += t;
    }
    for i in 0..dn {
      let t = fix_mul(od_x(a, i, sn) + od_x(a, i - 1, sn), 12993);
      a[(2 * i) as usize] += t;
    }
  }
}

/* ----------------------------------------------------------------------- */
/* 2-D separable transform over the resolution pyramid                     */

fn deinterleave(interleaved: &[i32], dn: i32, sn: i32, cas: i32, out: &mut dyn FnMut(usize, i32)) {
  for i in 0..sn {
    out(i as usize, interleaved[(2 * i + cas) as usize]);
  }
  for i in 0..dn {
    out((sn + i) as usize, interleaved[(2 * i + 1 - cas) as usize]);
  }
}

fn interleave(split: &dyn Fn(usize) -> i32, dn: i32, sn: i32, cas: i32, out: &mut [i32]) {
  for i in 0..sn {
    out[(2 * i + cas) as usize] = split(i as usize);
  }
  for i in 0..dn {
    out[(2 * i + 1 - cas) as usize] = split((sn + i) as usize);
  }
}

/// Forward transform in place. `resolutions` lists every resolution of
/// the component, lowest first; `data` rows have the full-resolution
/// width.
pub(crate) fn encode(data: &mut [i32], resolutions: &[ResRect], reversible: bool) {
  let lift: fn(&mut [i32], i32, i32, i32) = if reversible { encode_1_53 } else { encode_1_97 };
  let numres = resolutions.len();
  if numres < 2 {
    return;
  }
  let w = resolutions[numres - 1].w() as usize;
  for level in 0..numres - 1 {
    let cur = resolutions[numres - 1 - level];
    let low = resolutions[numres - 2 - level];
    let rw = cur.w() as i32;
    let rh = cur.h() as i32;
    let rw1 = low.w() as i32;
    let rh1 = low.h() as i32;
    let cas_row = (cur.x0 % 2) as i32;
    let cas_col = (cur.y0 % 2) as i32;

    // columns first
    let sn = rh1;
    let dn = rh - rh1;
    let mut col = vec![0i32; rh as usize];
    for j in 0..rw as usize {
      for (k, c) in col.iter_mut().enumerate() {
        *c = data[k * w + j];
      }
      lift(&mut col, dn, sn, cas_col);
      deinterleave(&col, dn, sn, cas_col, &mut |k, v| data[k * w + j] = v);
    }

    // then rows
    let sn = rw1;
    let dn = rw - rw1;
    let mut row = vec![0i32; rw as usize];
    for j in 0..rh as usize {
      row.copy_from_slice(&data[j * w..j * w + rw as usize]);
      lift(&mut row, dn, sn, cas_row);
      deinterleave(&row, dn, sn, cas_row, &mut |k, v| data[j * w + k] = v);
    }
  }
}

/// Inverse transform in place, producing resolutions `0..numres`.
/// `stride` is the row stride of `data` (the width of resolution
/// `numres - 1` when decoding to a reduced resolution count).
pub(crate) fn decode(
  data: &mut [i32],
  resolutions: &[ResRect],
  numres: usize,
  stride: u32,
  reversible: bool,
) {
  let lift: fn(&mut [i32], i32, i32, i32) = if reversible { decode_1_53 } else { decode_1_97 };
  if numres < 2 {
    return;
  }
  let w = stride as usize;
  let mut rw = resolutions[0].w() as i32;
  let mut rh = resolutions[0].h() as i32;
  for res in resolutions.iter().take(numres).skip(1) {
    let sn_h = rw;
    let sn_v = rh;
    rw = res.w() as i32;
    rh = res.h() as i32;
    let dn_h = rw - sn_h;
    let dn_v = rh - sn_v;
    let cas_row = (res.x0 % 2) as i32;
    let cas_col = (res.y0 % 2) as i32;

    // rows first
    let mut row = vec![0i32; rw as usize];
    for j in 0..rh as usize {
      let base = j * w;
      {
        let src = &data[base..base + rw as usize];
        interleave(&|k| src[k], dn_h, sn_h, cas_row, &mut row);
      }
      lift(&mut row, dn_h, sn_h, cas_row);
      data[base..base + rw as usize].copy_from_slice(&row);
    }

    // then columns
    let mut col = vec![0i32; rh as usize];
    for j in 0..rw as usize {
      {
        let data_ref = &data[..];
        interleave(&|k| data_ref[k * w + j], dn_v, sn_v, cas_col, &mut col);
      }
      lift(&mut col, dn_v, sn_v, cas_col);
      for (k, &v) in col.iter().enumerate() {
        data[k * w + j] = v;
      }
    }
  }
}

/* ----------------------------------------------------------------------- */
/* subband norms and quantization step sizes                               */

#[rustfmt::skip]
static DWT_NORMS: [[f64; 10]; 4] = [
  [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
  [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 0.0],
];

#[rustfmt::skip]
static DWT_NORMS_REAL: [[f64; 10]; 4] = [
  [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
  [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 0.0],
];

fn norm_lookup(table: &[[f64; 10]; 4], level: u32, orient: u32) -> f64 {
  let max = if orient == 0 { 9 } else { 8 };
  table[orient as usize][level.min(max) as usize]
}

/// L2 norm of the 5/3 synthesis basis for `level` decompositions.
pub(crate) fn getnorm(level: u32, orient: u32) -> f64 {
  norm_lookup(&DWT_NORMS, level, orient)
}

/// L2 norm of the 9/7 synthesis basis.
pub(crate) fn getnorm_real(level: u32, orient: u32) -> f64 {
  norm_lookup(&DWT_NORMS_REAL, level, orient)
}

/// Subband gain of the reversible transform (log2).
pub(crate) fn getgain(qmfbid: u32, orient: u32) -> u32 {
  if qmfbid != 1 {
    return 0;
  }
  match orient {
    0 => 0,
    1 | 2 => 1,
    _ => 2,
  }
}

fn encode_stepsize(stepsize: i32, numbps: i32) -> StepSize {
  let log = crate::math::floor_log2(stepsize as u32) as i32;
  let p = log - 13;
  let n = 11 - log;
  let mant = (if n < 0 { stepsize >> -n } else { stepsize << n }) & 0x7ff;
  StepSize { expn: numbps - p, mant }
}

/// Fill the per-band quantization step sizes signalled in QCD/QCC.
pub(crate) fn calc_explicit_stepsizes(tccp: &mut Tccp, prec: u32) {
  let numbands = 3 * tccp.numresolutions - 2;
  tccp.stepsizes = vec![StepSize::default(); numbands as usize];
  for bandno in 0..numbands {
    let resno = if bandno == 0 { 0 } else { (bandno - 1) / 3 + 1 };
    let orient = if bandno == 0 { 0 } else { (bandno - 1) % 3 + 1 };
    let level = tccp.numresolutions - 1 - resno;
    let gain = getgain(tccp.qmfbid, orient);
    let stepsize = if tccp.qntsty == QuantStyle::NoQuant {
      1.0
    } else {
      let norm = getnorm_real(level, orient);
      f64::from(1u32 << gain) / norm
    };
    tccp.stepsizes[bandno as usize] =
      encode_stepsize((stepsize * 8192.0).floor() as i32, (prec + gain) as i32);
  }
}

/// Dequantized band step size; `numbps = prec + gain` (invariant I5).
pub(crate) fn band_stepsize(ss: &StepSize, prec: u32, gain: u32) -> f64 {
  (1.0 + ss.mant as f64 / 2048.0) * 2f64.powi(prec as i32 + gain as i32 - ss.expn)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pyramid(x0: u32, y0: u32, x1: u32, y1: u32, numres: u32) -> Vec<ResRect> {
    use crate::math::ceil_div_pow2;
    (0..numres)
      .map(|r| {
        let l = numres - 1 - r;
        ResRect {
          x0: ceil_div_pow2(x0, l),
          y0: ceil_div_pow2(y0, l),
          x1: ceil_div_pow2(x1, l),
          y1: ceil_div_pow2(y1, l),
        }
      })
      .collect()
  }

  fn test_data(w: u32, h: u32) -> Vec<i32> {
    (0..w * h)
      .map(|i| ((i.wrapping_mul(2654435761u32)) >> 20) as i32 - 2048)
      .collect()
  }

  #[test]
  fn reversible_roundtrip_even_dims() {
    for numres in 1..=4 {
      let res = pyramid(0, 0, 32, 16, numres);
      let mut data = test_data(32, 16);
      let orig = data.clone();
      encode(&mut data, &res, true);
      decode(&mut data, &res, numres as usize, 32, true);
      assert_eq!(data, orig, "numres {numres}");
    }
  }

  #[test]
  fn reversible_roundtrip_odd_dims_and_origin() {
    // odd origin flips the lifting phase
    let cases = [(0u32, 0u32, 33u32, 17u32), (1, 1, 34, 18), (3, 5, 20, 22), (1, 0, 2, 9)];
    for (x0, y0, x1, y1) in cases {
      let w = x1 - x0;
      let h = y1 - y0;
      for numres in 1..=5 {
        let res = pyramid(x0, y0, x1, y1, numres);
        let mut data = test_data(w, h);
        let orig = data.clone();
        encode(&mut data, &res, true);
        decode(&mut data, &res, numres as usize, w, true);
        assert_eq!(data, orig, "extent [{x0},{x1})x[{y0},{y1}) numres {numres}");
      }
    }
  }

  #[test]
  fn irreversible_roundtrip_is_close() {
    let res = pyramid(0, 0, 64, 64, 4);
    // samples with 11 fractional bits, the irreversible pipeline scale
    let mut data: Vec<i32> = (0..64 * 64).map(|i| ((i % 255) as i32 - 128) << 11).collect();
    let orig = data.clone();
    encode(&mut data, &res, false);
    decode(&mut data, &res, 4, 64, false);
    for (i, (&got, &want)) in data.iter().zip(&orig).enumerate() {
      let err = (got - want).abs();
      // a few fixed-point ulps at 11 fractional bits
      assert!(err <= 64, "sample {i}: {got} vs {want}");
    }
  }

  #[test]
  fn partial_decode_produces_low_resolution() {
    let res = pyramid(0, 0, 16, 16, 3);
    let mut data = test_data(16, 16);
    encode(&mut data, &res, true);
    // only the lowest two resolutions; the level-0 LL corner must match
    // a full decode's low-pass content
    let mut partial = data.clone();
    decode(&mut partial, &res, 2, 16, true);
    let mut full = data;
    decode(&mut full, &res, 3, 16, true);
    // re-encode the full decode one level to recover the level-1 image
    let mut reencoded = full;
    encode(&mut reencoded, &res, true);
    decode(&mut reencoded, &res, 2, 16, true);
    let w1 = res[1].w() as usize;
    let h1 = res[1].h() as usize;
    for y in 0..h1 {
      for x in 0..w1 {
        assert_eq!(partial[y * 16 + x], reencoded[y * 16 + x]);
      }
    }
  }

  #[test]
  fn stepsize_derivation_reversible() {
    let mut tccp = Tccp {
      numresolutions: 3,
      qmfbid: 1,
      qntsty: QuantStyle::NoQuant,
      ..Tccp::default()
    };
    calc_explicit_stepsizes(&mut tccp, 8);
    assert_eq!(tccp.stepsizes.len(), 7);
    // no-quant: mantissa zero, expn = prec + gain
    assert_eq!(tccp.stepsizes[0].mant, 0);
    assert_eq!(tccp.stepsizes[0].expn, 8);
    // an HL/LH band at gain 1
    assert_eq!(tccp.stepsizes[1].mant, 0);
    assert_eq!(tccp.stepsizes[1].expn, 9);
    for ss in &tccp.stepsizes {
      assert!((band_stepsize(ss, 8, 0) - 1.0).abs() < 1e-9 || ss.expn > 8);
    }
  }

  #[test]
  fn stepsize_derivation_irreversible() {
    let mut tccp = Tccp {
      numresolutions: 3,
      qmfbid: 0,
      qntsty: QuantStyle::ScalarExpounded,
      ..Tccp::default()
    };
    calc_explicit_stepsizes(&mut tccp, 8);
    for (bandno, ss) in tccp.stepsizes.iter().enumerate() {
      assert!(ss.mant >= 0 && ss.mant < 2048, "band {bandno}");
      let step = band_stepsize(ss, 8, 0);
      assert!(step > 0.0 && step < 256.0, "band {bandno}: {step}");
    }
  }
}
