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

//! Tile coder/decoder: geometry tree construction, the per-tile encode
//! and decode pipelines, and PCRD rate allocation.

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::dwt::{self, ResRect};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::math::*;
use crate::mct;
use crate::params::{CodingParams, RateControl, Tcp};
use crate::pi::{PacketIter, PiComp, PiResolution};
use crate::t1::{self, Pass, T1, NMSEDEC_FRACBITS};
use crate::t2::{self, T2Mode};
use crate::tgt::TagTree;

/* ----------------------------------------------------------------------- */
/* tile tree                                                               */

/// Per-layer slice of a codeblock's embedded stream.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Layer {
  pub numpasses: u32,
  pub len: u32,
  pub disto: f64,
  /// Offset of this layer's bytes in the codeblock stream.
  pub start: u32,
}

/// Encoder-side codeblock.
#[derive(Debug, Default)]
pub(crate) struct EncCblk {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub numbps: u32,
  pub data: Vec<u8>,
  pub passes: SmallVec<[Pass; 16]>,
  pub layers: Vec<Layer>,
  /// Passes committed to already-final layers (rate-control state).
  pub numpassesinlayers: u32,
  /// Passes emitted by tier-2 so far (reset at each layer-0 packet).
  pub t2_included: u32,
  pub numlenbits: u32,
}

/// One decoded segment of a codeblock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DecSeg {
  /// Passes and bytes kept for tier-1 (layer cap honoured).
  pub numpasses: u32,
  pub len: u32,
  /// Passes parsed including discarded layers, for segment chaining.
  pub parsed_passes: u32,
  pub maxpasses: u32,
}

/// Decoder-side codeblock.
#[derive(Debug, Default)]
pub(crate) struct DecCblk {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub numbps: u32,
  pub numlenbits: u32,
  pub included: bool,
  pub segs: SmallVec<[DecSeg; 4]>,
  /// Concatenated kept body bytes.
  pub data: Vec<u8>,
}

pub(crate) trait CblkKind: Default + Send {
  fn with_rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Self;
}

impl CblkKind for EncCblk {
  fn with_rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
    EncCblk { x0, y0, x1, y1, ..Default::default() }
  }
}

impl CblkKind for DecCblk {
  fn with_rect(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
    DecCblk { x0, y0, x1, y1, ..Default::default() }
  }
}

#[derive(Debug)]
pub(crate) struct Precinct<C> {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  /// Codeblock grid dimensions.
  pub cw: u32,
  pub ch: u32,
  pub cblks: Vec<C>,
  pub incltree: TagTree,
  pub imsbtree: TagTree,
}

#[derive(Debug)]
pub(crate) struct Band<C> {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  /// Orientation: 0 = LL, 1 = HL, 2 = LH, 3 = HH.
  pub bandno: u32,
  pub numbps: u32,
  pub stepsize: f64,
  pub precincts: Vec<Precinct<C>>,
}

impl<C> Band<C> {
  pub fn is_empty(&self) -> bool {
    self.x1 <= self.x0 || self.y1 <= self.y0
  }
}

#[derive(Debug)]
pub(crate) struct Resolution<C> {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  /// Precinct grid and partition exponents.
  pub pw: u32,
  pub ph: u32,
  pub pdx: u32,
  pub pdy: u32,
  pub bands: Vec<Band<C>>,
}

#[derive(Debug)]
pub(crate) struct TileComp<C> {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub numresolutions: u32,
  /// Resolutions actually decoded (`numresolutions - reduce`).
  pub minimum_num_resolutions: u32,
  pub data: Vec<i32>,
  pub resolutions: Vec<Resolution<C>>,
  pub numpix: u64,
}

impl<C> TileComp<C> {
  pub fn width(&self) -> u32 {
    self.x1 - self.x0
  }

  pub fn height(&self) -> u32 {
    self.y1 - self.y0
  }

  /// Row stride of `data` (reduced width on the decoder side).
  pub fn data_stride(&self) -> u32 {
    let r = &self.resolutions[self.minimum_num_resolutions as usize - 1];
    r.x1 - r.x0
  }
}

#[derive(Debug)]
pub(crate) struct Tile<C> {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub comps: Vec<TileComp<C>>,
  pub numpix: u64,
  pub distotile: f64,
  pub distolayer: Vec<f64>,
}

pub(crate) type EncTile = Tile<EncCblk>;
pub(crate) type DecTile = Tile<DecCblk>;

/// Tile rectangle on the reference grid (B-7..B-10).
pub(crate) fn tile_rect(cp: &CodingParams, image: &Image, tileno: u32) -> (u32, u32, u32, u32) {
  let p = tileno % cp.tw;
  let q = tileno / cp.tw;
  let x0 = (cp.tx0 + p * cp.tdx).max(image.x0);
  let y0 = (cp.ty0 + q * cp.tdy).max(image.y0);
  let x1 = (cp.tx0 + (p + 1) * cp.tdx).min(image.x1);
  let y1 = (cp.ty0 + (q + 1) * cp.tdy).min(image.y1);
  (x0, y0, x1, y1)
}

/// Build the tile tree for one tile.
pub(crate) fn init_tile<C: CblkKind>(
  image: &Image,
  cp: &CodingParams,
  tcp: &Tcp,
  tileno: u32,
  decoding: bool,
) -> Result<Tile<C>> {
  let (tx0, ty0, tx1, ty1) = tile_rect(cp, image, tileno);
  if tx1 <= tx0 || ty1 <= ty0 {
    return Err(Error::InvalidGeometry(format!(
      "tile {tileno} has empty extents [{tx0},{tx1}) x [{ty0},{ty1})"
    )));
  }

  let mut comps = Vec::with_capacity(image.comps.len());
  for (compno, comp) in image.comps.iter().enumerate() {
    let tccp = &tcp.tccps[compno];
    if comp.dx == 0 || comp.dy == 0 {
      return Err(Error::InvalidGeometry(format!(
        "component {compno} has zero subsampling"
      )));
    }
    let cx0 = ceil_div(tx0, comp.dx);
    let cy0 = ceil_div(ty0, comp.dy);
    let cx1 = ceil_div(tx1, comp.dx);
    let cy1 = ceil_div(ty1, comp.dy);
    let numres = tccp.numresolutions;
    if numres == 0 || numres > crate::params::MAX_RESOLUTIONS {
      return Err(Error::InvalidParameter(format!(
        "numresolutions {numres} out of range"
      )));
    }
    let min_numres = if decoding {
      if cp.reduce >= numres {
        return Err(Error::InvalidParameter(format!(
          "reduce {} leaves no resolution to decode (numres {numres})",
          cp.reduce
        )));
      }
      numres - cp.reduce
    } else {
      numres
    };

    let mut resolutions = Vec::with_capacity(numres as usize);
    for resno in 0..numres {
      let level = numres - 1 - resno;
      let rx0 = ceil_div_pow2(cx0, level);
      let ry0 = ceil_div_pow2(cy0, level);
      let rx1 = ceil_div_pow2(cx1, level);
      let ry1 = ceil_div_pow2(cy1, level);

      let (pdx, pdy) = if tccp.csty.contains(crate::params::Csty::PRT) {
        (tccp.prcw[resno as usize], tccp.prch[resno as usize])
      } else {
        (15, 15)
      };

      let tl_prc_x = floor_div_pow2(rx0, pdx) << pdx;
      let tl_prc_y = floor_div_pow2(ry0, pdy) << pdy;
      let br_prc_x = ceil_div_pow2(rx1, pdx) << pdx;
      let br_prc_y = ceil_div_pow2(ry1, pdy) << pdy;
      let pw = if rx0 == rx1 { 0 } else { (br_prc_x - tl_prc_x) >> pdx };
      let ph = if ry0 == ry1 { 0 } else { (br_prc_y - tl_prc_y) >> pdy };

      let (tl_cbg_x, tl_cbg_y, cbgwidthexpn, cbgheightexpn) = if resno == 0 {
        (tl_prc_x, tl_prc_y, pdx, pdy)
      } else {
        (
          ceil_div_pow2(tl_prc_x, 1),
          ceil_div_pow2(tl_prc_y, 1),
          pdx.saturating_sub(1),
          pdy.saturating_sub(1),
        )
      };
      let cblkwidthexpn = tccp.cblkw.min(cbgwidthexpn);
      let cblkheightexpn = tccp.cblkh.min(cbgheightexpn);

      let numbands = if resno == 0 { 1 } else { 3 };
      let mut bands = Vec::with_capacity(numbands);
      for b in 0..numbands as u32 {
        let bandno = if resno == 0 { 0 } else { b + 1 };
        let (bx0, by0, bx1, by1) = if bandno == 0 {
          (
            ceil_div_pow2(cx0, level),
            ceil_div_pow2(cy0, level),
            ceil_div_pow2(cx1, level),
            ceil_div_pow2(cy1, level),
          )
        } else {
          let x0b = (bandno & 1) as i64;
          let y0b = (bandno >> 1) as i64;
          (
            int_ceil_div_pow2(cx0 as i64 - (1i64 << level) * x0b, level + 1).max(0) as u32,
            int_ceil_div_pow2(cy0 as i64 - (1i64 << level) * y0b, level + 1).max(0) as u32,
            int_ceil_div_pow2(cx1 as i64 - (1i64 << level) * x0b, level + 1).max(0) as u32,
            int_ceil_div_pow2(cy1 as i64 - (1i64 << level) * y0b, level + 1).max(0) as u32,
          )
        };

        let gain = dwt::getgain(tccp.qmfbid, bandno);
        let ss_index = if resno == 0 { 0 } else { 3 * (resno - 1) + bandno };
        let ss = tccp.stepsizes.get(ss_index as usize).ok_or_else(|| {
          Error::CorruptCodestream(format!(
            "no quantization step size for band {ss_index} of component {compno}"
          ))
        })?;
        let numbps =
          tccp.roishift + (ss.expn + tccp.numgbits as i32 - 1).max(0);
        let stepsize = dwt::band_stepsize(ss, comp.prec, gain);

        let mut precincts = Vec::with_capacity((pw * ph) as usize);
        for precno in 0..pw * ph {
          let cbg_x = tl_cbg_x + (precno % pw.max(1)) * (1 << cbgwidthexpn);
          let cbg_y = tl_cbg_y + (precno / pw.max(1)) * (1 << cbgheightexpn);
          let px0 = cbg_x.max(bx0);
          let py0 = cbg_y.max(by0);
          let px1 = (cbg_x + (1 << cbgwidthexpn)).min(bx1);
          let py1 = (cbg_y + (1 << cbgheightexpn)).min(by1);

          let (cw, ch, tl_cblk_x, tl_cblk_y) = if px1 > px0 && py1 > py0 {
            let tlx = floor_div_pow2(px0, cblkwidthexpn) << cblkwidthexpn;
            let tly = floor_div_pow2(py0, cblkheightexpn) << cblkheightexpn;
            let brx = ceil_div_pow2(px1, cblkwidthexpn) << cblkwidthexpn;
            let bry = ceil_div_pow2(py1, cblkheightexpn) << cblkheightexpn;
            ((brx - tlx) >> cblkwidthexpn, (bry - tly) >> cblkheightexpn, tlx, tly)
          } else {
            (0, 0, 0, 0)
          };

          let mut cblks = Vec::with_capacity((cw * ch) as usize);
          for cblkno in 0..cw * ch {
            let cbx = tl_cblk_x + (cblkno % cw) * (1 << cblkwidthexpn);
            let cby = tl_cblk_y + (cblkno / cw) * (1 << cblkheightexpn);
            cblks.push(C::with_rect(
              cbx.max(px0),
              cby.max(py0),
              (cbx + (1 << cblkwidthexpn)).min(px1),
              (cby + (1 << cblkheightexpn)).min(py1),
            ));
          }
          precincts.push(Precinct {
            x0: px0.min(px1),
            y0: py0.min(py1),
            x1: px1,
            y1: py1,
            cw,
            ch,
            cblks,
            incltree: TagTree::new(cw, ch),
            imsbtree: TagTree::new(cw, ch),
          });
        }
        bands.push(Band {
          x0: bx0,
          y0: by0,
          x1: bx1,
          y1: by1,
          bandno,
          numbps: numbps as u32,
          stepsize,
          precincts,
        });
      }
      resolutions.push(Resolution {
        x0: rx0,
        y0: ry0,
        x1: rx1,
        y1: ry1,
        pw,
        ph,
        pdx,
        pdy,
        bands,
      });
    }

    let stride_res = &resolutions[min_numres as usize - 1];
    let data_w = (stride_res.x1 - stride_res.x0) as usize;
    let data_h = (stride_res.y1 - stride_res.y0) as usize;
    let data_len = data_w
      .checked_mul(data_h)
      .ok_or(Error::Allocation(usize::MAX))?;

    comps.push(TileComp {
      x0: cx0,
      y0: cy0,
      x1: cx1,
      y1: cy1,
      numresolutions: numres,
      minimum_num_resolutions: min_numres,
      data: vec![0i32; data_len],
      resolutions,
      numpix: 0,
    });
  }

  let numlayers = tcp.numlayers as usize;
  Ok(Tile {
    x0: tx0,
    y0: ty0,
    x1: tx1,
    y1: ty1,
    comps,
    numpix: 0,
    distotile: 0.0,
    distolayer: vec![0.0; numlayers],
  })
}

/// Packet-iterator geometry for this tile.
pub(crate) fn pi_for_tile<C>(tile: &Tile<C>, image: &Image, numlayers: u32) -> PacketIter {
  let comps = tile
    .comps
    .iter()
    .zip(&image.comps)
    .map(|(tilec, comp)| PiComp {
      dx: comp.dx,
      dy: comp.dy,
      resolutions: tilec
        .resolutions
        .iter()
        .map(|r| PiResolution { pdx: r.pdx, pdy: r.pdy, pw: r.pw, ph: r.ph })
        .collect(),
    })
    .collect();
  PacketIter {
    tx0: tile.x0,
    ty0: tile.y0,
    tx1: tile.x1,
    ty1: tile.y1,
    numlayers,
    comps,
  }
}

fn res_rects<C>(tilec: &TileComp<C>) -> Vec<ResRect> {
  tilec
    .resolutions
    .iter()
    .map(|r| ResRect { x0: r.x0, y0: r.y0, x1: r.x1, y1: r.y1 })
    .collect()
}

/* ----------------------------------------------------------------------- */
/* sample transform                                                        */

/// Load tile samples from the image, applying the DC level shift (and the
/// fixed-point scale for the irreversible path).
fn dc_shift_encode(tile: &mut EncTile, image: &Image, tcp: &Tcp) {
  for (compno, tilec) in tile.comps.iter_mut().enumerate() {
    let comp = &image.comps[compno];
    let tccp = &tcp.tccps[compno];
    let shift = if comp.sgnd { 0 } else { 1i32 << (comp.prec - 1) };
    let comp_x0 = ceil_div(image.x0, comp.dx);
    let comp_y0 = ceil_div(image.y0, comp.dy);
    let w = tilec.width() as usize;
    for y in 0..tilec.height() as usize {
      let src_row = (tilec.y0 as usize - comp_y0 as usize + y) * comp.w as usize;
      for x in 0..w {
        let src = comp.data[src_row + tilec.x0 as usize - comp_x0 as usize + x];
        let v = src - shift;
        tilec.data[y * w + x] = if tccp.qmfbid == 1 { v } else { v << 11 };
      }
    }
  }
}

/// Undo the DC level shift, clamping to the component range, and store
/// the tile samples back into the image.
fn dc_shift_decode(tile: &DecTile, image: &mut Image, tcp: &Tcp, reduce: u32) {
  for (compno, tilec) in tile.comps.iter().enumerate() {
    let comp = &mut image.comps[compno];
    let tccp = &tcp.tccps[compno];
    let shift = if comp.sgnd { 0 } else { 1i32 << (comp.prec - 1) };
    let (lo, hi) = if comp.sgnd {
      (-(1i32 << (comp.prec - 1)), (1i32 << (comp.prec - 1)) - 1)
    } else {
      (0, (1i32 << comp.prec) - 1)
    };
    let res = &tilec.resolutions[tilec.minimum_num_resolutions as usize - 1];
    let stride = tilec.data_stride() as usize;
    // image-plane origin of the reduced component grid
    let comp_x0 = ceil_div_pow2(ceil_div(image.x0, comp.dx), reduce);
    let comp_y0 = ceil_div_pow2(ceil_div(image.y0, comp.dy), reduce);
    for y in 0..(res.y1 - res.y0) as usize {
      let dst_row = (res.y0 as usize - comp_y0 as usize + y) * comp.w as usize;
      for x in 0..(res.x1 - res.x0) as usize {
        let raw = tilec.data[y * stride + x];
        let v = if tccp.qmfbid == 1 {
          raw
        } else {
          // remove the 11-bit fixed-point scale with rounding
          let half = 1i32 << 10;
          if raw >= 0 { (raw + half) >> 11 } else { -((-raw + half) >> 11) }
        };
        comp.data[dst_row + res.x0 as usize - comp_x0 as usize + x] =
          clamp_i32(v + shift, lo, hi);
      }
    }
  }
}

fn split_three<C>(comps: &mut [TileComp<C>]) -> (&mut TileComp<C>, &mut TileComp<C>, &mut TileComp<C>) {
  let (a, rest) = comps.split_first_mut().unwrap();
  let (b, rest) = rest.split_first_mut().unwrap();
  let (c, _) = rest.split_first_mut().unwrap();
  (a, b, c)
}

fn mct_encode(tile: &mut EncTile, tcp: &Tcp) -> Result<()> {
  match tcp.mct {
    0 => Ok(()),
    1 => {
      if tile.comps.len() < 3 {
        return Err(Error::InvalidParameter("MCT needs three components".into()));
      }
      let same = tile.comps[..3]
        .windows(2)
        .all(|w| w[0].width() == w[1].width() && w[0].height() == w[1].height());
      if !same {
        return Err(Error::InvalidGeometry(
          "MCT requires identical component extents".into(),
        ));
      }
      let reversible = tcp.tccps[0].qmfbid == 1;
      let (c0, c1, c2) = split_three(&mut tile.comps);
      if reversible {
        mct::encode(&mut c0.data, &mut c1.data, &mut c2.data);
      } else {
        mct::encode_real(&mut c0.data, &mut c1.data, &mut c2.data);
      }
      Ok(())
    }
    _ => {
      let mct_data = tcp
        .custom_mct
        .as_ref()
        .ok_or_else(|| Error::InvalidParameter("custom MCT selected without a matrix".into()))?;
      let same = tile
        .comps
        .windows(2)
        .all(|w| w[0].width() == w[1].width() && w[0].height() == w[1].height());
      if !same {
        return Err(Error::InvalidGeometry(
          "MCT requires identical component extents".into(),
        ));
      }
      let mut planes: Vec<&mut [i32]> =
        tile.comps.iter_mut().map(|c| c.data.as_mut_slice()).collect();
      mct::encode_custom(&mct_data.forward, &mct_data.shifts, &mut planes);
      Ok(())
    }
  }
}

fn mct_decode(tile: &mut DecTile, tcp: &Tcp, custom: Option<&crate::params::CustomMct>) -> Result<()> {
  match tcp.mct {
    0 => Ok(()),
    1 => {
      if tile.comps.len() < 3 {
        return Err(Error::CorruptCodestream(
          "MCT signalled with fewer than three components".into(),
        ));
      }
      let same = tile.comps[..3]
        .windows(2)
        .all(|w| w[0].data.len() == w[1].data.len());
      if !same {
        return Err(Error::InvalidGeometry(
          "MCT requires identical component extents".into(),
        ));
      }
      let reversible = tcp.tccps[0].qmfbid == 1;
      let (c0, c1, c2) = split_three(&mut tile.comps);
      if reversible {
        mct::decode(&mut c0.data, &mut c1.data, &mut c2.data);
      } else {
        mct::decode_real(&mut c0.data, &mut c1.data, &mut c2.data);
      }
      Ok(())
    }
    _ => {
      let mct_data = custom.ok_or_else(|| {
        Error::Unsupported("codestream used a custom MCT; supply the inverse matrix".into())
      })?;
      let mut planes: Vec<&mut [i32]> =
        tile.comps.iter_mut().map(|c| c.data.as_mut_slice()).collect();
      mct::decode_custom(&mct_data.inverse, &mct_data.shifts, &mut planes);
      Ok(())
    }
  }
}

/* ----------------------------------------------------------------------- */
/* tier-1 over the tile                                                    */

struct EncJob<'a> {
  cblk: &'a mut EncCblk,
  bandno: u32,
  stepsize: f64,
  level: u32,
  /// Offset of the codeblock's top-left coefficient in the tile buffer.
  offset: usize,
  compno: u32,
}

fn t1_encode_tile(
  tile: &mut EncTile,
  tcp: &Tcp,
  pool: Option<&rayon::ThreadPool>,
  mct_norms: Option<Vec<f64>>,
) {
  tile.distotile = 0.0;
  let norms = mct_norms;
  for compno in 0..tile.comps.len() {
    let tccp = &tcp.tccps[compno];
    let tilec = &mut tile.comps[compno];
    let tile_w = tilec.width() as usize;
    let numres = tilec.numresolutions;
    // previous-resolution extents, for subband placement in the buffer
    let res_dims: Vec<(u32, u32)> = tilec
      .resolutions
      .iter()
      .map(|r| (r.x1 - r.x0, r.y1 - r.y0))
      .collect();

    let mut jobs: Vec<EncJob<'_>> = Vec::new();
    let data = &tilec.data;
    for (resno, res) in tilec.resolutions.iter_mut().enumerate() {
      let level = numres - 1 - resno as u32;
      for band in res.bands.iter_mut() {
        if band.is_empty() {
          continue;
        }
        let (band_x0, band_y0, bandno, stepsize) = (band.x0, band.y0, band.bandno, band.stepsize);
        for prc in band.precincts.iter_mut() {
          for cblk in prc.cblks.iter_mut() {
            let mut x = (cblk.x0 - band_x0) as usize;
            let mut y = (cblk.y0 - band_y0) as usize;
            if bandno & 1 != 0 {
              x += res_dims[resno - 1].0 as usize;
            }
            if bandno & 2 != 0 {
              y += res_dims[resno - 1].1 as usize;
            }
            jobs.push(EncJob {
              cblk,
              bandno,
              stepsize,
              level,
              offset: y * tile_w + x,
              compno: compno as u32,
            });
          }
        }
      }
    }

    let qmfbid = tccp.qmfbid;
    let cblksty = tccp.cblksty;
    let roishift = tccp.roishift;
    let norms_ref = norms.as_deref();
    let run = |job: &mut EncJob<'_>| -> f64 {
      let mut t1 = T1::new();
      let w = job.cblk.x1 - job.cblk.x0;
      let h = job.cblk.y1 - job.cblk.y0;
      if w == 0 || h == 0 {
        return 0.0;
      }
      t1.resize(w, h);
      let recip = if qmfbid == 1 {
        0
      } else {
        (8192.0 * 8192.0 / (job.stepsize * 8192.0).floor()) as i32
      };
      for row in 0..h as usize {
        for col in 0..w as usize {
          let src = job.cblk_src(row, col, tile_w, data);
          let q = if qmfbid == 1 {
            src << NMSEDEC_FRACBITS
          } else {
            fix_mul(src, recip) >> (11 - NMSEDEC_FRACBITS)
          };
          t1.data[row * w as usize + col] = q << roishift;
        }
      }
      let encoded = t1::encode_cblk(
        &mut t1,
        job.bandno,
        job.compno,
        job.level,
        qmfbid,
        job.stepsize,
        cblksty,
        norms_ref,
      );
      job.cblk.numbps = encoded.numbps;
      job.cblk.data = encoded.data;
      job.cblk.passes = encoded.passes;
      encoded.distortion
    };

    // collect in job order so the distortion sum is deterministic
    let distos: Vec<f64> = match pool {
      Some(p) => p.install(|| jobs.par_iter_mut().map(|j| run(j)).collect()),
      None => jobs.iter_mut().map(run).collect(),
    };
    tile.distotile += distos.iter().sum::<f64>();
  }
}

impl<'a> EncJob<'a> {
  #[inline]
  fn cblk_src(&self, row: usize, col: usize, tile_w: usize, data: &[i32]) -> i32 {
    data[self.offset + row * tile_w + col]
  }
}

struct DecJob<'a> {
  cblk: &'a DecCblk,
  bandno: u32,
  stepsize: f64,
  /// Destination offset in the tile buffer.
  offset: usize,
}

fn t1_decode_tile(
  tile: &mut DecTile,
  tcp: &Tcp,
  pool: Option<&rayon::ThreadPool>,
) -> Result<()> {
  for compno in 0..tile.comps.len() {
    let tccp = &tcp.tccps[compno];
    let tilec = &mut tile.comps[compno];
    let stride = tilec.data_stride() as usize;
    let min_numres = tilec.minimum_num_resolutions as usize;
    let res_dims: Vec<(u32, u32)> = tilec
      .resolutions
      .iter()
      .map(|r| (r.x1 - r.x0, r.y1 - r.y0))
      .collect();

    let mut jobs: Vec<DecJob<'_>> = Vec::new();
    for (resno, res) in tilec.resolutions.iter().enumerate().take(min_numres) {
      for band in &res.bands {
        if band.is_empty() {
          continue;
        }
        for prc in &band.precincts {
          for cblk in &prc.cblks {
            if cblk.x1 <= cblk.x0 || cblk.y1 <= cblk.y0 {
              continue;
            }
            let mut x = (cblk.x0 - band.x0) as usize;
            let mut y = (cblk.y0 - band.y0) as usize;
            if band.bandno & 1 != 0 {
              x += res_dims[resno - 1].0 as usize;
            }
            if band.bandno & 2 != 0 {
              y += res_dims[resno - 1].1 as usize;
            }
            jobs.push(DecJob {
              cblk,
              bandno: band.bandno,
              stepsize: band.stepsize,
              offset: y * stride + x,
            });
          }
        }
      }
    }

    let qmfbid = tccp.qmfbid;
    let cblksty = tccp.cblksty;
    let roishift = tccp.roishift;
    let run = |job: &DecJob<'_>| -> Result<(usize, u32, Vec<i32>)> {
      let w = job.cblk.x1 - job.cblk.x0;
      let h = job.cblk.y1 - job.cblk.y0;
      let mut t1 = T1::new();
      let mut segs: Vec<(&[u8], u32)> = Vec::new();
      let mut pos = 0usize;
      for seg in &job.cblk.segs {
        if seg.numpasses == 0 {
          continue;
        }
        let end = (pos + seg.len as usize).min(job.cblk.data.len());
        segs.push((&job.cblk.data[pos..end], seg.numpasses));
        pos = end;
      }
      t1::decode_cblk(&mut t1, w, h, job.cblk.numbps, job.bandno, cblksty, &segs)?;

      // ROI down-shift on the 2x-scaled magnitudes
      if roishift > 0 {
        let thresh = 1i32 << roishift;
        for v in t1.data.iter_mut() {
          let mag = v.abs();
          if mag >= thresh {
            let m = mag >> roishift;
            *v = if *v < 0 { -m } else { m };
          }
        }
      }
      // dequantize out of the half-bit representation
      let out: Vec<i32> = if qmfbid == 1 {
        t1.data.iter().map(|&v| v / 2).collect()
      } else {
        t1.data
          .iter()
          .map(|&v| {
            let tmp = v as f64 * job.stepsize * 1024.0;
            if tmp >= 0.0 { (tmp + 0.5) as i32 } else { -((-tmp + 0.5) as i32) }
          })
          .collect()
      };
      Ok((job.offset, w, out))
    };

    let results: Vec<Result<(usize, u32, Vec<i32>)>> = match pool {
      Some(p) => p.install(|| jobs.par_iter().map(run).collect()),
      None => jobs.iter().map(run).collect(),
    };
    for r in results {
      let (offset, w, block) = r?;
      for (row, chunk) in block.chunks(w as usize).enumerate() {
        let dst = offset + row * stride;
        tilec.data[dst..dst + w as usize].copy_from_slice(chunk);
      }
    }
  }
  Ok(())
}

/* ----------------------------------------------------------------------- */
/* PCRD rate allocation                                                    */

fn layer_needs_rate_control(cp: &CodingParams, tcp: &Tcp, layno: u32) -> bool {
  (cp.disto_alloc && tcp.rates[layno as usize] > 0.0)
    || (cp.fixed_quality && tcp.distoratio[layno as usize] > 0.0)
}

fn needs_rate_control(cp: &CodingParams, tcp: &Tcp) -> bool {
  (0..tcp.numlayers).any(|l| layer_needs_rate_control(cp, tcp, l))
}

fn for_each_enc_cblk<F: FnMut(&mut EncCblk)>(tile: &mut EncTile, mut f: F) {
  for tilec in tile.comps.iter_mut() {
    for res in tilec.resolutions.iter_mut() {
      for band in res.bands.iter_mut() {
        if band.is_empty() {
          continue;
        }
        for prc in band.precincts.iter_mut() {
          for cblk in prc.cblks.iter_mut() {
            f(cblk);
          }
        }
      }
    }
  }
}

fn prepare_block_for_first_layer(cblk: &mut EncCblk) {
  cblk.numpassesinlayers = 0;
  cblk.t2_included = 0;
  cblk.numlenbits = 0;
}

fn update_layer_span(cblk: &mut EncCblk, layno: u32, included: u32, final_pass: bool) -> f64 {
  let layer = &mut cblk.layers[layno as usize];
  layer.numpasses = included - cblk.numpassesinlayers;
  if layer.numpasses == 0 {
    layer.disto = 0.0;
    return 0.0;
  }
  if cblk.numpassesinlayers == 0 {
    layer.len = cblk.passes[included as usize - 1].rate;
    layer.start = 0;
    layer.disto = cblk.passes[included as usize - 1].distortiondec;
  } else {
    let prev = &cblk.passes[cblk.numpassesinlayers as usize - 1];
    layer.len = cblk.passes[included as usize - 1].rate - prev.rate;
    layer.start = prev.rate;
    layer.disto = cblk.passes[included as usize - 1].distortiondec - prev.distortiondec;
  }
  let disto = layer.disto;
  if final_pass {
    cblk.numpassesinlayers = included;
  }
  disto
}

/// Form `layno` by the simple slope threshold; `thresh == 0` includes
/// every remaining pass.
fn make_layer_simple(tile: &mut EncTile, layno: u32, thresh: f64, final_pass: bool) {
  let mut distolayer = 0.0;
  for_each_enc_cblk(tile, |cblk| {
    if layno == 0 {
      prepare_block_for_first_layer(cblk);
    }
    let total = cblk.passes.len() as u32;
    let mut included = if thresh == 0.0 {
      total
    } else {
      let mut included = cblk.numpassesinlayers;
      for passno in cblk.numpassesinlayers..total {
        let pass = &cblk.passes[passno as usize];
        let (dr, dd) = if included == 0 {
          (pass.rate, pass.distortiondec)
        } else {
          let prev = &cblk.passes[included as usize - 1];
          (pass.rate - prev.rate, pass.distortiondec - prev.distortiondec)
        };
        if dr == 0 {
          if dd != 0.0 {
            included = passno + 1;
          }
          continue;
        }
        let slope = dd / dr as f64;
        if thresh - slope < f64::EPSILON {
          included = passno + 1;
        }
      }
      included
    };
    included = included.min(total);
    distolayer += update_layer_span(cblk, layno, included, final_pass);
  });
  tile.distolayer[layno as usize] = distolayer;
}

/// Form `layno` from convex-hull truncation points at an integer slope
/// threshold.
fn make_layer_feasible(tile: &mut EncTile, layno: u32, thresh: u16, final_pass: bool) {
  let mut distolayer = 0.0;
  for_each_enc_cblk(tile, |cblk| {
    if layno == 0 {
      prepare_block_for_first_layer(cblk);
    }
    let total = cblk.passes.len() as u32;
    let mut included = cblk.numpassesinlayers;
    for passno in cblk.numpassesinlayers..total {
      let pass = &cblk.passes[passno as usize];
      if pass.slope != 0 {
        if pass.slope <= thresh {
          break;
        }
        included = passno + 1;
      }
    }
    distolayer += update_layer_span(cblk, layno, included, final_pass);
  });
  tile.distolayer[layno as usize] = distolayer;
}

/// Put every remaining pass of every codeblock into `layno`.
fn make_layer_final(tile: &mut EncTile, layno: u32) {
  let mut distolayer = 0.0;
  for_each_enc_cblk(tile, |cblk| {
    if layno == 0 {
      prepare_block_for_first_layer(cblk);
    }
    let total = cblk.passes.len() as u32;
    let included = total.max(cblk.numpassesinlayers);
    distolayer += update_layer_span(cblk, layno, included, true);
  });
  tile.distolayer[layno as usize] = distolayer;
}

/// Mark convex-hull truncation points with their 8.8 fixed-point log
/// slopes; non-hull passes keep slope 0.
fn convex_hull(passes: &mut [Pass]) {
  for pass in passes.iter_mut() {
    pass.slope = 0;
  }
  if passes.is_empty() {
    return;
  }
  // monotone chain over (rate, distortion); index -1 is the origin
  let point = |passes: &[Pass], i: isize| -> (f64, f64) {
    if i < 0 {
      (0.0, 0.0)
    } else {
      (passes[i as usize].rate as f64, passes[i as usize].distortiondec)
    }
  };
  let slope = |passes: &[Pass], a: isize, b: isize| -> f64 {
    let (ra, da) = point(passes, a);
    let (rb, db) = point(passes, b);
    (db - da) / (rb - ra)
  };
  let mut hull: Vec<isize> = Vec::with_capacity(passes.len());
  for i in 0..passes.len() as isize {
    let last = *hull.last().unwrap_or(&-1);
    if point(passes, i).0 <= point(passes, last).0 {
      // zero-rate pass cannot be a truncation point
      continue;
    }
    while !hull.is_empty() {
      let last = *hull.last().unwrap();
      let prev = if hull.len() >= 2 { hull[hull.len() - 2] } else { -1 };
      if slope(passes, last, i) >= slope(passes, prev, last) {
        hull.pop();
      } else {
        break;
      }
    }
    hull.push(i);
  }
  let mut prev: isize = -1;
  for &i in &hull {
    let s = slope(passes, prev, i);
    let fixed = if s > 0.0 {
      ((s.ln() * 256.0).round() + 8192.0).clamp(1.0, 65535.0) as u16
    } else {
      1
    };
    passes[i as usize].slope = fixed.max(1);
    prev = i;
  }
}

fn tile_pixel_stats(tile: &mut EncTile, image: &Image) -> f64 {
  let mut max_se = 0.0f64;
  tile.numpix = 0;
  for (compno, tilec) in tile.comps.iter_mut().enumerate() {
    tilec.numpix = 0;
    for res in &tilec.resolutions {
      for band in &res.bands {
        if band.is_empty() {
          continue;
        }
        for prc in &band.precincts {
          for cblk in &prc.cblks {
            let numpix = ((cblk.x1 - cblk.x0) * (cblk.y1 - cblk.y0)) as u64;
            tilec.numpix += numpix;
          }
        }
      }
    }
    tile.numpix += tilec.numpix;
    let peak = (1u64 << image.comps[compno].prec) as f64 - 1.0;
    max_se += peak * peak * tilec.numpix as f64;
  }
  max_se
}

/// Cumulative byte budget per layer, derived from the rate targets.
fn layer_budgets(tile: &EncTile, image: &Image, tcp: &Tcp, len: u64) -> Vec<u64> {
  let mut uncompressed = 0u64;
  for (compno, tilec) in tile.comps.iter().enumerate() {
    let prec = image.comps[compno].prec as u64;
    uncompressed += tilec.width() as u64 * tilec.height() as u64 * prec.div_ceil(8);
  }
  tcp
    .rates
    .iter()
    .map(|&r| {
      if r <= 0.0 {
        len
      } else if r <= 1.0 {
        ((uncompressed as f64 * r as f64).ceil() as u64).min(len)
      } else {
        ((uncompressed as f64 / r as f64).ceil() as u64).min(len)
      }
    })
    .collect()
}

#[allow(clippy::too_many_arguments)]
fn pcrd_bisect_simple(
  tile: &mut EncTile,
  image: &Image,
  cp: &CodingParams,
  tcp: &Tcp,
  tileno: u32,
  len: u64,
) -> Result<()> {
  let single_lossless = tcp.numlayers == 1 && !layer_needs_rate_control(cp, tcp, 0);
  let max_se = tile_pixel_stats(tile, image);

  let mut min_slope = f64::MAX;
  let mut max_slope = -1.0f64;
  if !single_lossless {
    for_each_enc_cblk(tile, |cblk| {
      for passno in 0..cblk.passes.len() {
        let pass = &cblk.passes[passno];
        let (dr, dd) = if passno == 0 {
          (pass.rate as i64, pass.distortiondec)
        } else {
          let prev = &cblk.passes[passno - 1];
          ((pass.rate - prev.rate) as i64, pass.distortiondec - prev.distortiondec)
        };
        if dr == 0 {
          continue;
        }
        let slope = dd / dr as f64;
        min_slope = min_slope.min(slope);
        max_slope = max_slope.max(slope);
      }
    });
  } else {
    make_layer_final(tile, 0);
    return Ok(());
  }

  let budgets = layer_budgets(tile, image, tcp, len);
  let mut cumdisto = vec![0.0f64; tcp.numlayers as usize];
  let k_factor = 1.0;
  let mut upper_bound = max_slope;
  for layno in 0..tcp.numlayers {
    if layer_needs_rate_control(cp, tcp, layno) {
      let mut lower_bound = min_slope;
      let maxlen = budgets[layno as usize];
      let distotarget = tile.distotile
        - (k_factor * max_se) / 10f64.powf(tcp.distoratio[layno as usize] as f64 / 10.0);
      let goodthresh;
      let mut prevthresh = -1.0f64;
      let mut thresh = lower_bound;
      for _ in 0..128 {
        thresh = if upper_bound == -1.0 {
          lower_bound
        } else {
          (lower_bound + upper_bound) / 2.0
        };
        make_layer_simple(tile, layno, thresh, false);
        if prevthresh != -1.0 && (prevthresh - thresh).abs() < 0.001 {
          break;
        }
        prevthresh = thresh;
        if cp.fixed_quality {
          let distoachieved = if layno == 0 {
            tile.distolayer[0]
          } else {
            cumdisto[layno as usize - 1] + tile.distolayer[layno as usize]
          };
          if distoachieved < distotarget {
            upper_bound = thresh;
            continue;
          }
          lower_bound = thresh;
        } else {
          let fits = t2::encode_packets(
            tile,
            image,
            tcp,
            cp,
            tileno,
            layno + 1,
            maxlen as usize,
            T2Mode::ThreshCalc,
          )?
          .is_some();
          if !fits {
            lower_bound = thresh;
            continue;
          }
          upper_bound = thresh;
        }
      }
      // conservative: the bound known not to exceed the budget
      goodthresh = if upper_bound == -1.0 { thresh } else { upper_bound };
      make_layer_simple(tile, layno, goodthresh, true);
      cumdisto[layno as usize] = if layno == 0 {
        tile.distolayer[0]
      } else {
        cumdisto[layno as usize - 1] + tile.distolayer[layno as usize]
      };
      upper_bound = lower_bound - 1.0;
    } else {
      // no target: take every remaining pass
      make_layer_simple(tile, layno, 0.0, true);
    }
  }
  Ok(())
}

#[allow(clippy::too_many_arguments)]
fn pcrd_bisect_feasible(
  tile: &mut EncTile,
  image: &Image,
  cp: &CodingParams,
  tcp: &Tcp,
  tileno: u32,
  len: u64,
) -> Result<()> {
  let single_lossless = tcp.numlayers == 1 && !layer_needs_rate_control(cp, tcp, 0);
  let max_se = tile_pixel_stats(tile, image);

  if single_lossless {
    make_layer_final(tile, 0);
    return Ok(());
  }

  let mut min_slope = u16::MAX;
  for_each_enc_cblk(tile, |cblk| {
    convex_hull(&mut cblk.passes);
    for pass in cblk.passes.iter() {
      if pass.slope != 0 {
        min_slope = min_slope.min(pass.slope);
      }
    }
  });

  let budgets = layer_budgets(tile, image, tcp, len);
  let mut cumdisto = vec![0.0f64; tcp.numlayers as usize];
  let k_factor = 1.0;
  let mut upper_bound = u16::MAX as u32;
  for layno in 0..tcp.numlayers {
    if layer_needs_rate_control(cp, tcp, layno) {
      let mut lower_bound = min_slope as u32;
      let maxlen = budgets[layno as usize];
      let distotarget = tile.distotile
        - (k_factor * max_se) / 10f64.powf(tcp.distoratio[layno as usize] as f64 / 10.0);
      let mut prevthresh = 0u32;
      for _ in 0..128 {
        let thresh = (lower_bound + upper_bound) >> 1;
        if prevthresh != 0 && prevthresh == thresh {
          break;
        }
        make_layer_feasible(tile, layno, thresh as u16, false);
        prevthresh = thresh;
        if cp.fixed_quality {
          let distoachieved = if layno == 0 {
            tile.distolayer[0]
          } else {
            cumdisto[layno as usize - 1] + tile.distolayer[layno as usize]
          };
          if distoachieved < distotarget {
            upper_bound = thresh;
            continue;
          }
          lower_bound = thresh;
        } else {
          let fits = t2::encode_packets(
            tile,
            image,
            tcp,
            cp,
            tileno,
            layno + 1,
            maxlen as usize,
            T2Mode::ThreshCalc,
          )?
          .is_some();
          if !fits {
            lower_bound = thresh;
            continue;
          }
          upper_bound = thresh;
        }
      }
      let goodthresh = upper_bound;
      make_layer_feasible(tile, layno, goodthresh as u16, true);
      cumdisto[layno as usize] = if layno == 0 {
        tile.distolayer[0]
      } else {
        cumdisto[layno as usize - 1] + tile.distolayer[layno as usize]
      };
      upper_bound = lower_bound.saturating_sub(1);
    } else {
      make_layer_final(tile, layno);
    }
  }
  Ok(())
}

fn rate_allocate(
  tile: &mut EncTile,
  image: &Image,
  cp: &CodingParams,
  tcp: &Tcp,
  tileno: u32,
  len: u64,
) -> Result<()> {
  if !needs_rate_control(cp, tcp) && tcp.numlayers == 1 {
    // single lossless layer: everything, unconditionally
    tile_pixel_stats(tile, image);
    make_layer_final(tile, 0);
    return Ok(());
  }
  match cp.rate_control {
    RateControl::Simple => pcrd_bisect_simple(tile, image, cp, tcp, tileno, len),
    RateControl::Feasible => pcrd_bisect_feasible(tile, image, cp, tcp, tileno, len),
  }
}

/* ----------------------------------------------------------------------- */
/* pipelines                                                               */

fn alloc_layers(tile: &mut EncTile, numlayers: u32) {
  for_each_enc_cblk(tile, |cblk| {
    cblk.layers = vec![Layer::default(); numlayers as usize];
  });
}

/// Encode one tile; returns the packet stream for its tile part.
pub(crate) fn encode_tile(
  image: &Image,
  cp: &CodingParams,
  tileno: u32,
  pool: Option<&rayon::ThreadPool>,
) -> Result<Vec<u8>> {
  let tcp = &cp.tcps[tileno as usize];
  let mut tile: EncTile = init_tile(image, cp, tcp, tileno, false)?;
  alloc_layers(&mut tile, tcp.numlayers);

  dc_shift_encode(&mut tile, image, tcp);
  mct_encode(&mut tile, tcp)?;

  for (compno, tilec) in tile.comps.iter_mut().enumerate() {
    let reversible = tcp.tccps[compno].qmfbid == 1;
    let rects = res_rects(tilec);
    dwt::encode(&mut tilec.data, &rects, reversible);
  }

  let mct_norms = match tcp.mct {
    1 => {
      if tcp.tccps[0].qmfbid == 1 {
        Some(mct::norms().to_vec())
      } else {
        Some(mct::norms_real().to_vec())
      }
    }
    2 => tcp
      .custom_mct
      .as_ref()
      .map(|m| mct::calculate_norms(&m.forward, image.numcomps())),
    _ => None,
  };
  t1_encode_tile(&mut tile, tcp, pool, mct_norms);

  // available budget for this tile's packets
  let mut uncompressed = 0u64;
  for (compno, tilec) in tile.comps.iter().enumerate() {
    let prec = image.comps[compno].prec as u64;
    uncompressed += tilec.width() as u64 * tilec.height() as u64 * prec.div_ceil(8) * 2;
  }
  let mut len = uncompressed + 8192;
  if cp.max_cs_size > 0 {
    let per_tile = (cp.max_cs_size as u64).saturating_sub(512) / cp.numtiles() as u64;
    len = len.min(per_tile);
  }

  rate_allocate(&mut tile, image, cp, tcp, tileno, len)?;

  let bytes = t2::encode_packets(
    &mut tile,
    image,
    tcp,
    cp,
    tileno,
    tcp.numlayers,
    len as usize,
    T2Mode::FinalPass,
  )?
  .ok_or_else(|| {
    Error::InvalidParameter("tile byte budget exhausted during final packet emission".into())
  })?;
  Ok(bytes)
}

/// Decode one tile from its tile-part payload into the image.
pub(crate) fn decode_tile(
  image: &mut Image,
  cp: &CodingParams,
  tileno: u32,
  data: &[u8],
  custom_mct: Option<&crate::params::CustomMct>,
  pool: Option<&rayon::ThreadPool>,
) -> Result<()> {
  let tcp = &cp.tcps[tileno as usize];
  let mut tile: DecTile = init_tile(image, cp, tcp, tileno, true)?;

  match t2::decode_packets(&mut tile, image, tcp, cp, tileno, data) {
    Ok(()) => {}
    Err(Error::CorruptCodestream(msg)) => {
      // truncated stream: decode what arrived intact
      log::warn!("tile {tileno}: {msg}; decoding the packets read so far");
    }
    Err(e) => return Err(e),
  }

  t1_decode_tile(&mut tile, tcp, pool)?;

  for (compno, tilec) in tile.comps.iter_mut().enumerate() {
    let reversible = tcp.tccps[compno].qmfbid == 1;
    let rects = res_rects(tilec);
    let numres = tilec.minimum_num_resolutions as usize;
    let stride = tilec.data_stride();
    dwt::decode(&mut tilec.data, &rects, numres, stride, reversible);
  }

  mct_decode(&mut tile, tcp, custom_mct)?;
  dc_shift_decode(&tile, image, tcp, cp.reduce);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::params::{CompressParams, Csty};

  fn simple_cp(image: &Image, params: &CompressParams) -> CodingParams {
    crate::j2k::coding_params_for_tests(image, params)
  }

  #[test]
  fn tile_grid_covers_image() {
    let image = Image::with_dims(513, 513, 1, 8, false).unwrap();
    let mut params = CompressParams::default();
    params.tile_size_on = true;
    params.tdx = 256;
    params.tdy = 256;
    let cp = simple_cp(&image, &params);
    assert_eq!(cp.tw, 3);
    assert_eq!(cp.th, 3);
    // bottom-right tile is 1x1
    let (x0, y0, x1, y1) = tile_rect(&cp, &image, 8);
    assert_eq!((x1 - x0, y1 - y0), (1, 1));
  }

  #[test]
  fn resolution_pyramid_extents() {
    let image = Image::with_dims(64, 48, 1, 8, false).unwrap();
    let mut params = CompressParams::default();
    params.numresolution = 3;
    let cp = simple_cp(&image, &params);
    let tile: EncTile = init_tile(&image, &cp, &cp.tcps[0], 0, false).unwrap();
    let tilec = &tile.comps[0];
    assert_eq!(tilec.resolutions.len(), 3);
    assert_eq!((tilec.resolutions[2].x1, tilec.resolutions[2].y1), (64, 48));
    assert_eq!((tilec.resolutions[1].x1, tilec.resolutions[1].y1), (32, 24));
    assert_eq!((tilec.resolutions[0].x1, tilec.resolutions[0].y1), (16, 12));
    assert_eq!(tilec.resolutions[0].bands.len(), 1);
    assert_eq!(tilec.resolutions[1].bands.len(), 3);
    // band extents of the level-1 HL band
    let hl = &tilec.resolutions[1].bands[0];
    assert_eq!(hl.bandno, 1);
    assert_eq!((hl.x1 - hl.x0, hl.y1 - hl.y0), (16, 12));
  }

  #[test]
  fn codeblock_grid_respects_exponents() {
    let image = Image::with_dims(100, 80, 1, 8, false).unwrap();
    let mut params = CompressParams::default();
    params.numresolution = 2;
    params.cblockw_init = 32;
    params.cblockh_init = 32;
    let cp = simple_cp(&image, &params);
    let tile: EncTile = init_tile(&image, &cp, &cp.tcps[0], 0, false).unwrap();
    let res1 = &tile.comps[0].resolutions[1];
    let band = &res1.bands[0];
    let prc = &band.precincts[0];
    // HL band is 50x40, blocks of 32 -> 2x2 grid
    assert_eq!((prc.cw, prc.ch), (2, 2));
    for cblk in &prc.cblks {
      assert!(cblk.x1 - cblk.x0 <= 32);
      assert!(cblk.y1 - cblk.y0 <= 32);
      assert!((cblk.x1 - cblk.x0) * (cblk.y1 - cblk.y0) <= 4096);
    }
  }

  #[test]
  fn explicit_precincts_shrink_codeblocks() {
    let image = Image::with_dims(256, 256, 1, 8, false).unwrap();
    let mut params = CompressParams::default();
    params.numresolution = 2;
    params.csty = Csty::PRT;
    params.prcw_init = vec![6, 6];
    params.prch_init = vec![6, 6];
    let cp = simple_cp(&image, &params);
    let tile: EncTile = init_tile(&image, &cp, &cp.tcps[0], 0, false).unwrap();
    let res1 = &tile.comps[0].resolutions[1];
    assert_eq!((res1.pdx, res1.pdy), (6, 6));
    // codeblock partition halves at r >= 1
    let band = &res1.bands[0];
    for prc in &band.precincts {
      for cblk in &prc.cblks {
        assert!(cblk.x1 - cblk.x0 <= 32);
      }
    }
  }

  #[test]
  fn zero_tile_rejected() {
    let image = Image::with_dims(16, 16, 1, 8, false).unwrap();
    let mut params = CompressParams::default();
    params.tile_size_on = true;
    params.tdx = 16;
    params.tdy = 16;
    let mut cp = simple_cp(&image, &params);
    // forge an out-of-range tile index producing empty extents
    cp.tw = 2;
    cp.tcps.push(cp.tcps[0].clone());
    let r: Result<EncTile> = init_tile(&image, &cp, &cp.tcps[0], 1, false);
    assert!(r.is_err());
  }
}
