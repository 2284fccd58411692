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

//! Multi-component transforms over the first three (or, for the custom
//! matrix, all) tile components.

use crate::math::fix_mul;

/* Norms of the basis functions of the reversible MCT. */
static MCT_NORMS: [f64; 3] = [1.732, 0.8292, 0.8292];
/* Norms of the basis functions of the irreversible MCT. */
static MCT_NORMS_REAL: [f64; 3] = [1.732, 1.805, 1.573];

pub(crate) fn norms() -> &'static [f64; 3] {
  &MCT_NORMS
}

pub(crate) fn norms_real() -> &'static [f64; 3] {
  &MCT_NORMS_REAL
}

/// Forward reversible MCT (RCT).
pub(crate) fn encode(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let r = c0[i];
    let g = c1[i];
    let b = c2[i];
    let y = (r + g * 2 + b) >> 2;
    let u = b - g;
    let v = r - g;
    c0[i] = y;
    c1[i] = u;
    c2[i] = v;
  }
}

/// Inverse reversible MCT.
pub(crate) fn decode(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let y = c0[i];
    let u = c1[i];
    let v = c2[i];
    let g = y - ((u + v) >> 2);
    let r = v + g;
    let b = u + g;
    c0[i] = r;
    c1[i] = g;
    c2[i] = b;
  }
}

/// Forward irreversible MCT (BT.601 ICT), 13-bit fixed point.
pub(crate) fn encode_real(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let r = c0[i];
    let g = c1[i];
    let b = c2[i];
    let y = fix_mul(r, 2449) + fix_mul(g, 4809) + fix_mul(b, 934);
    let u = -fix_mul(r, 1382) - fix_mul(g, 2714) + fix_mul(b, 4096);
    let v = fix_mul(r, 4096) - fix_mul(g, 3430) - fix_mul(b, 666);
    c0[i] = y;
    c1[i] = u;
    c2[i] = v;
  }
}

/// Inverse irreversible MCT.
pub(crate) fn decode_real(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for i in 0..c0.len() {
    let y = c0[i];
    let u = c1[i];
    let v = c2[i];
    let r = y + fix_mul(v, 11485);
    let g = y - fix_mul(u, 2819) - fix_mul(v, 5850);
    let b = y + fix_mul(u, 14516);
    c0[i] = r;
    c1[i] = g;
    c2[i] = b;
  }
}

/// Forward custom MCT: fixed-point matrix multiply plus shift vector,
/// sample by sample across all component planes.
pub(crate) fn encode_custom(matrix: &[f32], shifts: &[i32], planes: &mut [&mut [i32]]) {
  let n = planes.len();
  debug_assert_eq!(matrix.len(), n * n);
  debug_assert_eq!(shifts.len(), n);
  let fixed: Vec<i32> = matrix.iter().map(|&m| (m * 8192.0) as i32).collect();
  let len = planes[0].len();
  let mut current = vec![0i32; n];
  for i in 0..len {
    for (j, plane) in planes.iter().enumerate() {
      current[j] = plane[i];
    }
    for j in 0..n {
      let mut acc = 0i32;
      for k in 0..n {
        acc += fix_mul(fixed[j * n + k], current[k]);
      }
      planes[j][i] = acc + shifts[j];
    }
  }
}

/// Inverse custom MCT: floating-point multiply by the caller-supplied
/// inverse matrix after removing the shifts.
pub(crate) fn decode_custom(inverse: &[f32], shifts: &[i32], planes: &mut [&mut [i32]]) {
  let n = planes.len();
  debug_assert_eq!(inverse.len(), n * n);
  debug_assert_eq!(shifts.len(), n);
  let len = planes[0].len();
  let mut current = vec![0f32; n];
  for i in 0..len {
    for (j, plane) in planes.iter().enumerate() {
      current[j] = (plane[i] - shifts[j]) as f32;
    }
    for j in 0..n {
      let mut acc = 0f32;
      for k in 0..n {
        acc += inverse[j * n + k] * current[k];
      }
      planes[j][i] = acc.round() as i32;
    }
  }
}

/// Component norms of a custom matrix, for rate-distortion weighting.
pub(crate) fn calculate_norms(matrix: &[f32], numcomps: u32) -> Vec<f64> {
  let n = numcomps as usize;
  let mut out = vec![0f64; n];
  for (i, norm) in out.iter_mut().enumerate() {
    let mut index = i;
    for _ in 0..n {
      let v = matrix[index] as f64;
      *norm += v * v;
      index += n;
    }
    *norm = norm.sqrt();
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rct_is_exactly_invertible() {
    let mut r: Vec<i32> = (-64..64).collect();
    let mut g: Vec<i32> = (-64..64).rev().collect();
    let mut b: Vec<i32> = (0..128).map(|i| (i * 3 % 97) - 48).collect();
    let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
    encode(&mut r, &mut g, &mut b);
    decode(&mut r, &mut g, &mut b);
    assert_eq!(r, r0);
    assert_eq!(g, g0);
    assert_eq!(b, b0);
  }

  #[test]
  fn ict_roundtrip_is_close() {
    // fixed-point samples with 11 fractional bits
    let mut r: Vec<i32> = (0..64).map(|i| (i - 32) << 11).collect();
    let mut g: Vec<i32> = (0..64).map(|i| (47 - i) << 11).collect();
    let mut b: Vec<i32> = (0..64).map(|i| (i / 2) << 11).collect();
    let (r0, g0, b0) = (r.clone(), g.clone(), b.clone());
    encode_real(&mut r, &mut g, &mut b);
    decode_real(&mut r, &mut g, &mut b);
    for i in 0..64 {
      assert!((r[i] - r0[i]).abs() <= 8, "r[{i}]");
      assert!((g[i] - g0[i]).abs() <= 8, "g[{i}]");
      assert!((b[i] - b0[i]).abs() <= 8, "b[{i}]");
    }
  }

  #[test]
  fn identity_custom_mct_is_exact() {
    let matrix = [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    let shifts = [0i32; 3];
    let mut a: Vec<i32> = (-16..16).collect();
    let mut b: Vec<i32> = (0..32).map(|i| i * 7 - 100).collect();
    let mut c: Vec<i32> = (0..32).map(|i| -i * 3).collect();
    let (a0, b0, c0) = (a.clone(), b.clone(), c.clone());
    {
      let mut planes: Vec<&mut [i32]> = vec![&mut a, &mut b, &mut c];
      encode_custom(&matrix, &shifts, &mut planes);
    }
    assert_eq!(a, a0);
    assert_eq!(b, b0);
    assert_eq!(c, c0);
  }

  #[test]
  fn custom_mct_shift_roundtrip() {
    let matrix = [1.0f32, 0.0, 0.0, 1.0];
    let inverse = [1.0f32, 0.0, 0.0, 1.0];
    let shifts = [5i32, -3];
    let mut a: Vec<i32> = (0..16).collect();
    let mut b: Vec<i32> = (0..16).map(|i| i * 2).collect();
    let (a0, b0) = (a.clone(), b.clone());
    {
      let mut planes: Vec<&mut [i32]> = vec![&mut a, &mut b];
      encode_custom(&matrix, &shifts, &mut planes);
      decode_custom(&inverse, &shifts, &mut planes);
    }
    assert_eq!(a, a0);
    assert_eq!(b, b0);
  }

  #[test]
  fn norms_of_identity_are_one() {
    let matrix = [1.0f32, 0.0, 0.0, 1.0];
    let norms = calculate_norms(&matrix, 2);
    assert!((norms[0] - 1.0).abs() < 1e-9);
    assert!((norms[1] - 1.0).abs() < 1e-9);
  }
}
