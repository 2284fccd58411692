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

//! Packet progression iteration.
//!
//! The packet sequence for a tile is materialised eagerly from the
//! nested progression loops; positional orders (RPCL, PCRL, CPRL) walk
//! the reference grid with the minimal projected precinct step and are
//! deduplicated, so each `(layer, resolution, component, precinct)`
//! tuple appears exactly once, in progression order.

use std::collections::HashSet;

use crate::math::*;
use crate::params::ProgOrder;

/// Per-resolution geometry the iterator needs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PiResolution {
  /// Precinct partition exponents.
  pub pdx: u32,
  pub pdy: u32,
  /// Precinct grid dimensions.
  pub pw: u32,
  pub ph: u32,
}

/// Per-component geometry the iterator needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct PiComp {
  pub dx: u32,
  pub dy: u32,
  pub resolutions: Vec<PiResolution>,
}

/// One packet position in progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketPos {
  pub compno: u32,
  pub resno: u32,
  pub precno: u32,
  pub layno: u32,
}

pub(crate) struct PacketIter {
  pub tx0: u32,
  pub ty0: u32,
  pub tx1: u32,
  pub ty1: u32,
  pub numlayers: u32,
  pub comps: Vec<PiComp>,
}

impl PacketIter {
  /// The packet sequence for the configured progression order.
  pub fn sequence(&self, prog: ProgOrder) -> Vec<PacketPos> {
    match prog {
      ProgOrder::Lrcp => self.seq_lrcp(),
      ProgOrder::Rlcp => self.seq_rlcp(),
      ProgOrder::Rpcl => self.seq_positional(prog),
      ProgOrder::Pcrl => self.seq_positional(prog),
      ProgOrder::Cprl => self.seq_positional(prog),
    }
  }

  fn max_resolutions(&self) -> u32 {
    self.comps.iter().map(|c| c.resolutions.len() as u32).max().unwrap_or(0)
  }

  fn seq_lrcp(&self) -> Vec<PacketPos> {
    let mut out = Vec::new();
    for layno in 0..self.numlayers {
      for resno in 0..self.max_resolutions() {
        for (compno, comp) in self.comps.iter().enumerate() {
          let Some(res) = comp.resolutions.get(resno as usize) else {
            continue;
          };
          for precno in 0..res.pw * res.ph {
            out.push(PacketPos { compno: compno as u32, resno, precno, layno });
          }
        }
      }
    }
    out
  }

  fn seq_rlcp(&self) -> Vec<PacketPos> {
    let mut out = Vec::new();
    for resno in 0..self.max_resolutions() {
      for layno in 0..self.numlayers {
        for (compno, comp) in self.comps.iter().enumerate() {
          let Some(res) = comp.resolutions.get(resno as usize) else {
            continue;
          };
          for precno in 0..res.pw * res.ph {
            out.push(PacketPos { compno: compno as u32, resno, precno, layno });
          }
        }
      }
    }
    out
  }

  /// Minimal projected precinct step over the given components.
  fn grid_steps(&self, comps: &[(u32, &PiComp)]) -> (u64, u64) {
    let mut dx = 0u64;
    let mut dy = 0u64;
    for (_, comp) in comps {
      let numres = comp.resolutions.len() as u32;
      for (resno, res) in comp.resolutions.iter().enumerate() {
        let level = numres - 1 - resno as u32;
        let cdx = (comp.dx as u64) << (res.pdx + level).min(40);
        let cdy = (comp.dy as u64) << (res.pdy + level).min(40);
        dx = if dx == 0 { cdx } else { dx.min(cdx) };
        dy = if dy == 0 { cdy } else { dy.min(cdy) };
      }
    }
    (dx.max(1), dy.max(1))
  }

  /// Precinct index of grid position `(x, y)` for `(comp, resno)`, or
  /// `None` when the position is not a precinct anchor there.
  fn precno_at(&self, comp: &PiComp, resno: u32, x: u64, y: u64) -> Option<u32> {
    let numres = comp.resolutions.len() as u32;
    if resno >= numres {
      return None;
    }
    let res = &comp.resolutions[resno as usize];
    if res.pw == 0 || res.ph == 0 {
      return None;
    }
    let level = numres - 1 - resno;
    let cdx = comp.dx as u64;
    let cdy = comp.dy as u64;
    let trx0 = int_ceil_div_pow2(ceil_div_u64(self.tx0 as u64, cdx) as i64, level) as u64;
    let try0 = int_ceil_div_pow2(ceil_div_u64(self.ty0 as u64, cdy) as i64, level) as u64;
    let trx1 = int_ceil_div_pow2(ceil_div_u64(self.tx1 as u64, cdx) as i64, level) as u64;
    let try1 = int_ceil_div_pow2(ceil_div_u64(self.ty1 as u64, cdy) as i64, level) as u64;
    if trx0 == trx1 || try0 == try1 {
      return None;
    }
    let rpx = res.pdx + level;
    let rpy = res.pdy + level;
    let x_anchor =
      x % (cdx << rpx) == 0 || (x == self.tx0 as u64 && (trx0 << level) % (1 << rpx) != 0);
    let y_anchor =
      y % (cdy << rpy) == 0 || (y == self.ty0 as u64 && (try0 << level) % (1 << rpy) != 0);
    if !x_anchor || !y_anchor {
      return None;
    }
    let prci = floor_div_pow2(ceil_div_u64(x, cdx << level) as u32, res.pdx)
      - floor_div_pow2(trx0 as u32, res.pdx);
    let prcj = floor_div_pow2(ceil_div_u64(y, cdy << level) as u32, res.pdy)
      - floor_div_pow2(try0 as u32, res.pdy);
    Some(prci + prcj * res.pw)
  }

  fn seq_positional(&self, prog: ProgOrder) -> Vec<PacketPos> {
    let mut out = Vec::new();
    let mut seen: HashSet<(u32, u32, u32, u32)> = HashSet::new();
    let all: Vec<(u32, &PiComp)> =
      self.comps.iter().enumerate().map(|(i, c)| (i as u32, c)).collect();

    let mut emit = |out: &mut Vec<PacketPos>,
                    seen: &mut HashSet<(u32, u32, u32, u32)>,
                    compno: u32,
                    resno: u32,
                    precno: u32| {
      for layno in 0..self.numlayers {
        if seen.insert((compno, resno, precno, layno)) {
          out.push(PacketPos { compno, resno, precno, layno });
        }
      }
    };

    match prog {
      ProgOrder::Rpcl => {
        let (dx, dy) = self.grid_steps(&all);
        for resno in 0..self.max_resolutions() {
          let mut y = self.ty0 as u64;
          while y < self.ty1 as u64 {
            let mut x = self.tx0 as u64;
            while x < self.tx1 as u64 {
              for (compno, comp) in &all {
                if let Some(precno) = self.precno_at(comp, resno, x, y) {
                  emit(&mut out, &mut seen, *compno, resno, precno);
                }
              }
              x += dx - (x % dx);
            }
            y += dy - (y % dy);
          }
        }
      }
      ProgOrder::Pcrl => {
        let (dx, dy) = self.grid_steps(&all);
        let mut y = self.ty0 as u64;
        while y < self.ty1 as u64 {
          let mut x = self.tx0 as u64;
          while x < self.tx1 as u64 {
            for (compno, comp) in &all {
              for resno in 0..comp.resolutions.len() as u32 {
                if let Some(precno) = self.precno_at(comp, resno, x, y) {
                  emit(&mut out, &mut seen, *compno, resno, precno);
                }
              }
            }
            x += dx - (x % dx);
          }
          y += dy - (y % dy);
        }
      }
      ProgOrder::Cprl => {
        for (compno, comp) in &all {
          let one = [(*compno, *comp)];
          let (dx, dy) = self.grid_steps(&one);
          let mut y = self.ty0 as u64;
          while y < self.ty1 as u64 {
            let mut x = self.tx0 as u64;
            while x < self.tx1 as u64 {
              for resno in 0..comp.resolutions.len() as u32 {
                if let Some(precno) = self.precno_at(comp, resno, x, y) {
                  emit(&mut out, &mut seen, *compno, resno, precno);
                }
              }
              x += dx - (x % dx);
            }
            y += dy - (y % dy);
          }
        }
      }
      _ => unreachable!(),
    }
    out
  }
}

fn ceil_div_u64(a: u64, b: u64) -> u64 {
  (a + b - 1) / b
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simple_iter(numres: u32, numlayers: u32, numcomps: u32, pw: u32, ph: u32) -> PacketIter {
    let comp = PiComp {
      dx: 1,
      dy: 1,
      resolutions: (0..numres)
        .map(|_| PiResolution { pdx: 15, pdy: 15, pw, ph })
        .collect(),
    };
    PacketIter {
      tx0: 0,
      ty0: 0,
      tx1: 64,
      ty1: 64,
      numlayers,
      comps: (0..numcomps).map(|_| comp.clone()).collect(),
    }
  }

  #[test]
  fn lrcp_counts_and_order() {
    let pi = simple_iter(3, 2, 2, 1, 1);
    let seq = pi.sequence(ProgOrder::Lrcp);
    assert_eq!(seq.len(), 3 * 2 * 2);
    // layer is the slowest axis
    assert!(seq[..6].iter().all(|p| p.layno == 0));
    assert!(seq[6..].iter().all(|p| p.layno == 1));
    // within a layer, resolution before component
    assert_eq!(seq[0], PacketPos { compno: 0, resno: 0, precno: 0, layno: 0 });
    assert_eq!(seq[1], PacketPos { compno: 1, resno: 0, precno: 0, layno: 0 });
    assert_eq!(seq[2].resno, 1);
  }

  #[test]
  fn rlcp_resolution_is_slowest() {
    let pi = simple_iter(3, 2, 1, 1, 1);
    let seq = pi.sequence(ProgOrder::Rlcp);
    assert_eq!(seq.len(), 6);
    assert!(seq[..2].iter().all(|p| p.resno == 0));
    assert_eq!(seq[0].layno, 0);
    assert_eq!(seq[1].layno, 1);
  }

  #[test]
  fn positional_orders_cover_every_packet_once() {
    for prog in [ProgOrder::Rpcl, ProgOrder::Pcrl, ProgOrder::Cprl] {
      let pi = simple_iter(3, 2, 2, 1, 1);
      let seq = pi.sequence(prog);
      assert_eq!(seq.len(), 3 * 2 * 2, "{prog:?}");
      let unique: HashSet<_> =
        seq.iter().map(|p| (p.compno, p.resno, p.precno, p.layno)).collect();
      assert_eq!(unique.len(), seq.len(), "{prog:?}");
    }
  }

  #[test]
  fn positional_orders_cover_multi_precinct_grids() {
    // 64x64 tile, 2 resolutions, precinct exponent 5 at full resolution
    let comp = PiComp {
      dx: 1,
      dy: 1,
      resolutions: vec![
        PiResolution { pdx: 5, pdy: 5, pw: 1, ph: 1 },
        PiResolution { pdx: 5, pdy: 5, pw: 2, ph: 2 },
      ],
    };
    let pi = PacketIter {
      tx0: 0,
      ty0: 0,
      tx1: 64,
      ty1: 64,
      numlayers: 1,
      comps: vec![comp],
    };
    for prog in [ProgOrder::Rpcl, ProgOrder::Pcrl, ProgOrder::Cprl] {
      let seq = pi.sequence(prog);
      assert_eq!(seq.len(), 1 + 4, "{prog:?}");
      let unique: HashSet<_> =
        seq.iter().map(|p| (p.compno, p.resno, p.precno, p.layno)).collect();
      assert_eq!(unique.len(), seq.len(), "{prog:?}");
    }
  }

  #[test]
  fn all_orders_agree_on_the_packet_set() {
    let pi = simple_iter(2, 3, 3, 1, 1);
    let reference: HashSet<_> = pi
      .sequence(ProgOrder::Lrcp)
      .iter()
      .map(|p| (p.compno, p.resno, p.precno, p.layno))
      .collect();
    for prog in [ProgOrder::Rlcp, ProgOrder::Rpcl, ProgOrder::Pcrl, ProgOrder::Cprl] {
      let set: HashSet<_> = pi
        .sequence(prog)
        .iter()
        .map(|p| (p.compno, p.resno, p.precno, p.layno))
        .collect();
      assert_eq!(set, reference, "{prog:?}");
    }
  }
}
