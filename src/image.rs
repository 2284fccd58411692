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
use crate::math::*;

/// Maximum component bit depth accepted on the reference grid.
pub const MAX_PRECISION: u32 = 38;

/// One component plane of an [`Image`].
///
/// The sample array is dense, row-major, `w * h` entries, where `w` and
/// `h` derive from the image extents by ceiling division with the
/// subsampling factors.
#[derive(Debug, Clone, Default)]
pub struct ImageComp {
  /// Horizontal subsampling on the reference grid.
  pub dx: u32,
  /// Vertical subsampling on the reference grid.
  pub dy: u32,
  /// Samples per row.
  pub w: u32,
  /// Rows.
  pub h: u32,
  /// Horizontal offset of the first sample on the reference grid.
  pub x0: u32,
  /// Vertical offset of the first sample on the reference grid.
  pub y0: u32,
  /// Bit precision, `1..=38`.
  pub prec: u32,
  /// Signed samples.
  pub sgnd: bool,
  /// Number of decoded resolution levels (decoder bookkeeping).
  pub resno_decoded: u32,
  /// Resolution reduction factor applied on decode.
  pub factor: u32,
  /// Sample plane.
  pub data: Vec<i32>,
}

impl ImageComp {
  pub fn alloc_data(&mut self) -> Result<()> {
    let len = (self.w as usize)
      .checked_mul(self.h as usize)
      .ok_or(Error::Allocation(usize::MAX))?;
    self.data = vec![0i32; len];
    Ok(())
  }
}

/// Parameters for one component of a new image.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompParams {
  pub dx: u32,
  pub dy: u32,
  pub x0: u32,
  pub y0: u32,
  pub prec: u32,
  pub sgnd: bool,
}

/// A rectangular grid `[x0,x1) x [y0,y1)` on the reference grid with `N`
/// component planes.
#[derive(Debug, Clone, Default)]
pub struct Image {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub comps: Vec<ImageComp>,
}

impl Image {
  /// Build an image with allocated, zeroed sample planes.
  pub fn new(x0: u32, y0: u32, x1: u32, y1: u32, comp_params: &[ImageCompParams]) -> Result<Self> {
    if x1 <= x0 || y1 <= y0 {
      return Err(Error::InvalidGeometry(format!(
        "image extents [{x0},{x1}) x [{y0},{y1}) are empty"
      )));
    }
    if comp_params.is_empty() {
      return Err(Error::InvalidParameter(
        "image needs at least one component".into(),
      ));
    }
    let mut comps = Vec::with_capacity(comp_params.len());
    for (i, p) in comp_params.iter().enumerate() {
      if p.dx == 0 || p.dy == 0 {
        return Err(Error::InvalidGeometry(format!(
          "component {i} has zero subsampling"
        )));
      }
      if p.prec == 0 || p.prec > MAX_PRECISION {
        return Err(Error::InvalidParameter(format!(
          "component {i} precision {} out of [1,{MAX_PRECISION}]",
          p.prec
        )));
      }
      let mut comp = ImageComp {
        dx: p.dx,
        dy: p.dy,
        w: ceil_div(x1 - x0, p.dx),
        h: ceil_div(y1 - y0, p.dy),
        x0: p.x0,
        y0: p.y0,
        prec: p.prec,
        sgnd: p.sgnd,
        resno_decoded: 0,
        factor: 0,
        data: Vec::new(),
      };
      comp.alloc_data()?;
      comps.push(comp);
    }
    Ok(Image { x0, y0, x1, y1, comps })
  }

  /// Shorthand for an unsubsampled image anchored at the origin.
  pub fn with_dims(w: u32, h: u32, numcomps: u32, prec: u32, sgnd: bool) -> Result<Self> {
    let p = ImageCompParams {
      dx: 1,
      dy: 1,
      x0: 0,
      y0: 0,
      prec,
      sgnd,
    };
    let params = vec![p; numcomps as usize];
    Image::new(0, 0, w, h, &params)
  }

  pub fn numcomps(&self) -> u32 {
    self.comps.len() as u32
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subsampled_component_dims() {
    let params = [
      ImageCompParams { dx: 1, dy: 1, x0: 0, y0: 0, prec: 8, sgnd: false },
      ImageCompParams { dx: 2, dy: 2, x0: 0, y0: 0, prec: 8, sgnd: false },
    ];
    let img = Image::new(0, 0, 17, 9, &params).unwrap();
    assert_eq!(img.comps[0].w, 17);
    assert_eq!(img.comps[0].h, 9);
    assert_eq!(img.comps[1].w, 9);
    assert_eq!(img.comps[1].h, 5);
    assert_eq!(img.comps[1].data.len(), 45);
  }

  #[test]
  fn rejects_empty_extents() {
    assert!(Image::with_dims(0, 4, 1, 8, false).is_err());
  }

  #[test]
  fn rejects_zero_subsampling() {
    let p = [ImageCompParams { dx: 0, dy: 1, x0: 0, y0: 0, prec: 8, sgnd: false }];
    assert!(Image::new(0, 0, 4, 4, &p).is_err());
  }
}
