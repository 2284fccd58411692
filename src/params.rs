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

use crate::error::{Error, Result};
use crate::image::Image;
use crate::math::*;

/// Maximum number of quality layers per tile.
pub const MAX_LAYERS: u32 = 100;
/// Maximum `numresolution` (decomposition levels + 1).
pub const MAX_RESOLUTIONS: u32 = 33;
/// Guard bits written by the encoder.
pub const NUM_GUARD_BITS: u32 = 2;

/// Packet progression order, as encoded in COD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgOrder {
  #[default]
  Lrcp = 0,
  Rlcp = 1,
  Rpcl = 2,
  Pcrl = 3,
  Cprl = 4,
}

impl ProgOrder {
  pub(crate) fn from_u8(v: u8) -> Result<Self> {
    Ok(match v {
      0 => ProgOrder::Lrcp,
      1 => ProgOrder::Rlcp,
      2 => ProgOrder::Rpcl,
      3 => ProgOrder::Pcrl,
      4 => ProgOrder::Cprl,
      _ => {
        return Err(Error::CorruptCodestream(format!(
          "unknown progression order {v}"
        )))
      }
    })
  }
}

bitflags::bitflags! {
  /// Coding-style bits of the COD marker.
  #[derive(Default)]
  pub struct Csty: u8 {
    /// Precinct sizes are signalled explicitly.
    const PRT = 0x01;
    /// Emit SOP markers before each packet.
    const SOP = 0x02;
    /// Emit an EPH marker after each packet header.
    const EPH = 0x04;
  }
}

bitflags::bitflags! {
  /// Tier-1 codeblock mode switches (SPcod style byte).
  #[derive(Default)]
  pub struct CblkStyle: u8 {
    /// Selective arithmetic bypass (lazy raw coding).
    const LAZY = 0x01;
    /// Reset context probabilities after each pass.
    const RESET = 0x02;
    /// Terminate every coding pass.
    const TERMALL = 0x04;
    /// Vertically stripe-causal contexts.
    const VSC = 0x08;
    /// Predictable termination.
    const PTERM = 0x10;
    /// Segmentation symbol at the end of each cleanup pass.
    const SEGSYM = 0x20;
  }
}

/// Quality-layer allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControl {
  /// Bisect over raw rate-distortion slopes.
  #[default]
  Simple = 0,
  /// Bisect over convex-hull truncation points.
  Feasible = 1,
}

/// Custom multi-component transform supplied by the caller.
///
/// The forward matrix is applied (fixed point) on encode after the DC
/// shift; the inverse matrix is applied (floating point) on decode. The
/// matrices are `numcomps x numcomps`, row-major.
#[derive(Debug, Clone)]
pub struct CustomMct {
  pub forward: Vec<f32>,
  pub inverse: Vec<f32>,
  pub shifts: Vec<i32>,
}

/// Multi-component transform selector (`tcp_mct`).
#[derive(Debug, Clone, Default)]
pub enum Mct {
  #[default]
  None,
  /// RCT for the reversible pipeline, ICT for the irreversible one.
  Default,
  Custom(CustomMct),
}

impl Mct {
  pub(crate) fn code(&self) -> u8 {
    match self {
      Mct::None => 0,
      Mct::Default => 1,
      Mct::Custom(_) => 2,
    }
  }
}

/// Compression configuration bundle recognised by the core.
#[derive(Debug, Clone)]
pub struct CompressParams {
  /// Tile the image on a custom grid rather than one image-sized tile.
  pub tile_size_on: bool,
  pub tx0: u32,
  pub ty0: u32,
  pub tdx: u32,
  pub tdy: u32,
  /// DWT decomposition levels + 1, `1..=33`.
  pub numresolution: u32,
  /// Codeblock width (power of two, `4..=1024`).
  pub cblockw_init: u32,
  /// Codeblock height (power of two, `4..=1024`).
  pub cblockh_init: u32,
  pub prog_order: ProgOrder,
  /// Quality layers, `1..=100`.
  pub numlayers: u32,
  /// Per-layer rate targets. `0` = no target; values in `(0,1]` are a
  /// fraction of the uncompressed size; values `> 1` are compression
  /// ratios.
  pub rates: Vec<f32>,
  /// Per-layer PSNR targets in dB for fixed-quality allocation.
  pub distoratio: Vec<f32>,
  /// Allocate layers by rate.
  pub disto_alloc: bool,
  /// Allocate layers by quality.
  pub fixed_quality: bool,
  /// `false` = 5/3 reversible, `true` = 9/7 irreversible.
  pub irreversible: bool,
  pub mct: Mct,
  pub cblk_style: CblkStyle,
  pub csty: Csty,
  /// Explicit precinct exponents per resolution, outermost first.
  /// Empty = maximal precincts (2^15).
  pub prcw_init: Vec<u32>,
  pub prch_init: Vec<u32>,
  /// Region-of-interest component, or `None`.
  pub roi_compno: Option<u32>,
  /// ROI up-shift applied to the ROI component.
  pub roi_shift: u32,
  pub rate_control: RateControl,
  /// Hard cap on the whole codestream, bytes. `0` = unlimited.
  pub max_cs_size: usize,
  /// Hard cap on any single component's packet bytes per tile. `0` = unlimited.
  pub max_comp_size: usize,
  /// Profile code written to SIZ.
  pub rsiz: u16,
  /// Comment written to the COM segment; `None` writes the default.
  pub comment: Option<String>,
}

impl Default for CompressParams {
  fn default() -> Self {
    Self {
      tile_size_on: false,
      tx0: 0,
      ty0: 0,
      tdx: 0,
      tdy: 0,
      numresolution: 6,
      cblockw_init: 64,
      cblockh_init: 64,
      prog_order: ProgOrder::Lrcp,
      numlayers: 1,
      rates: Vec::new(),
      distoratio: Vec::new(),
      disto_alloc: false,
      fixed_quality: false,
      irreversible: false,
      mct: Mct::None,
      cblk_style: CblkStyle::empty(),
      csty: Csty::empty(),
      prcw_init: Vec::new(),
      prch_init: Vec::new(),
      roi_compno: None,
      roi_shift: 0,
      rate_control: RateControl::Simple,
      max_cs_size: 0,
      max_comp_size: 0,
      rsiz: 0,
      comment: None,
    }
  }
}

impl CompressParams {
  pub(crate) fn validate(&self, image: &Image) -> Result<()> {
    if self.numresolution == 0 || self.numresolution > MAX_RESOLUTIONS {
      return Err(Error::InvalidParameter(format!(
        "numresolution {} out of [1,{MAX_RESOLUTIONS}]",
        self.numresolution
      )));
    }
    if self.numlayers == 0 || self.numlayers > MAX_LAYERS {
      return Err(Error::InvalidParameter(format!(
        "numlayers {} out of [1,{MAX_LAYERS}]",
        self.numlayers
      )));
    }
    for (name, cb) in [("cblockw_init", self.cblockw_init), ("cblockh_init", self.cblockh_init)] {
      if !cb.is_power_of_two() || !(4..=1024).contains(&cb) {
        return Err(Error::InvalidParameter(format!(
          "{name} {cb} must be a power of two in [4,1024]"
        )));
      }
    }
    let cbw = floor_log2(self.cblockw_init);
    let cbh = floor_log2(self.cblockh_init);
    if cbw + cbh > 12 {
      return Err(Error::InvalidParameter(format!(
        "codeblock area 2^{} exceeds 4096 samples",
        cbw + cbh
      )));
    }
    if self.tile_size_on {
      if self.tdx == 0 || self.tdy == 0 {
        return Err(Error::InvalidGeometry("zero tile size".into()));
      }
      if self.tx0 > image.x0 || self.ty0 > image.y0 {
        return Err(Error::InvalidGeometry(
          "tile grid origin must not exceed the image origin".into(),
        ));
      }
    }
    if let Some(compno) = self.roi_compno {
      if compno >= image.numcomps() {
        return Err(Error::InvalidParameter(format!(
          "roi_compno {compno} out of range"
        )));
      }
      if self.roi_shift > 37 {
        return Err(Error::InvalidParameter(format!(
          "roi_shift {} out of [0,37]",
          self.roi_shift
        )));
      }
    }
    if let Mct::Custom(mct) = &self.mct {
      let n = image.numcomps() as usize;
      if mct.forward.len() != n * n || mct.inverse.len() != n * n || mct.shifts.len() != n {
        return Err(Error::InvalidParameter(
          "custom MCT matrix/shift dimensions do not match the component count".into(),
        ));
      }
    }
    if matches!(self.mct, Mct::Default) && image.numcomps() < 3 {
      return Err(Error::InvalidParameter(
        "default MCT needs at least three components".into(),
      ));
    }
    if self.prcw_init.len() != self.prch_init.len() {
      return Err(Error::InvalidParameter(
        "precinct width/height specs differ in length".into(),
      ));
    }
    for &p in self.prcw_init.iter().chain(self.prch_init.iter()) {
      if p == 0 || p > 15 {
        return Err(Error::InvalidParameter(format!(
          "precinct exponent {p} out of [1,15]"
        )));
      }
    }
    if self.disto_alloc && self.fixed_quality {
      return Err(Error::InvalidParameter(
        "disto_alloc and fixed_quality are mutually exclusive".into(),
      ));
    }
    Ok(())
  }
}

/// Decompression configuration bundle.
#[derive(Debug, Clone, Default)]
pub struct DecompressParams {
  /// Discard this many highest resolution levels while decoding.
  pub cp_reduce: u32,
  /// Decode at most this many layers; `0` = all.
  pub cp_layer: u32,
  /// Inverse matrix for codestreams encoded with a custom MCT.
  pub custom_mct: Option<CustomMct>,
}

/// Quantization style, SQcd/SQcc low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantStyle {
  /// Reversible, no quantization; 8-bit exponents on the wire.
  #[default]
  NoQuant = 0,
  /// Scalar expounded; 16-bit exponent/mantissa pairs on the wire.
  ScalarExpounded = 2,
}

/// One quantization step size as signalled in QCD/QCC.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSize {
  pub expn: i32,
  pub mant: i32,
}

/// Per tile-component coding parameters (derived from COD/COC/QCD/QCC).
#[derive(Debug, Clone, Default)]
pub(crate) struct Tccp {
  pub csty: Csty,
  pub numresolutions: u32,
  /// Codeblock exponents.
  pub cblkw: u32,
  pub cblkh: u32,
  pub cblksty: CblkStyle,
  /// 1 = reversible 5/3, 0 = irreversible 9/7.
  pub qmfbid: u32,
  pub qntsty: QuantStyle,
  /// `3 * numresolutions - 2` entries, band order LL, (HL,LH,HH)...
  pub stepsizes: Vec<StepSize>,
  pub numgbits: u32,
  pub roishift: i32,
  /// Precinct exponents per resolution, index 0 = lowest resolution.
  pub prcw: Vec<u32>,
  pub prch: Vec<u32>,
}

/// Per-tile coding parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tcp {
  pub csty: Csty,
  pub prg: ProgOrder,
  pub numlayers: u32,
  pub rates: Vec<f32>,
  pub distoratio: Vec<f32>,
  /// COD multiple-component-transform selector.
  pub mct: u8,
  pub custom_mct: Option<CustomMct>,
  pub tccps: Vec<Tccp>,
}

/// Image-wide coding parameters shared by every stage.
#[derive(Debug, Clone, Default)]
pub(crate) struct CodingParams {
  pub tx0: u32,
  pub ty0: u32,
  pub tdx: u32,
  pub tdy: u32,
  /// Tiles across / down.
  pub tw: u32,
  pub th: u32,
  pub disto_alloc: bool,
  pub fixed_quality: bool,
  pub rate_control: RateControl,
  pub max_cs_size: usize,
  pub max_comp_size: usize,
  pub rsiz: u16,
  /// Decode-side resolution reduction.
  pub reduce: u32,
  /// Decode-side layer cap; `0` = all.
  pub layer_cap: u32,
  /// One entry per tile; encode uses identical entries.
  pub tcps: Vec<Tcp>,
}

impl CodingParams {
  pub(crate) fn numtiles(&self) -> u32 {
    self.tw * self.th
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_params_validate() {
    let image = Image::with_dims(64, 64, 1, 8, false).unwrap();
    CompressParams::default().validate(&image).unwrap();
  }

  #[test]
  fn rejects_resolution_range() {
    let image = Image::with_dims(64, 64, 1, 8, false).unwrap();
    let mut p = CompressParams::default();
    p.numresolution = 34;
    assert!(matches!(p.validate(&image), Err(Error::InvalidParameter(_))));
  }

  #[test]
  fn rejects_oversized_codeblock() {
    let image = Image::with_dims(64, 64, 1, 8, false).unwrap();
    let mut p = CompressParams::default();
    p.cblockw_init = 256;
    p.cblockh_init = 64;
    assert!(p.validate(&image).is_err());
  }

  #[test]
  fn rejects_default_mct_on_grayscale() {
    let image = Image::with_dims(64, 64, 1, 8, false).unwrap();
    let mut p = CompressParams::default();
    p.mct = Mct::Default;
    assert!(p.validate(&image).is_err());
  }
}
