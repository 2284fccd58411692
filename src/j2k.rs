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

//! Codestream syntax (ISO/IEC 15444-1 Annex A): the main header, tile
//! parts, and the top-level [`Codec`] driving the tile pipeline.

use crate::cio::ByteStream;
use crate::dwt;
use crate::error::{Error, Result};
use crate::image::{Image, ImageComp};
use crate::math::*;
use crate::params::*;
use crate::tcd;

/* Annex A marker codes. */
const MS_SOC: u16 = 0xff4f;
const MS_SIZ: u16 = 0xff51;
const MS_COD: u16 = 0xff52;
const MS_COC: u16 = 0xff53;
const MS_TLM: u16 = 0xff55;
const MS_PLM: u16 = 0xff57;
const MS_QCD: u16 = 0xff5c;
const MS_QCC: u16 = 0xff5d;
const MS_RGN: u16 = 0xff5e;
const MS_POC: u16 = 0xff5f;
const MS_PPM: u16 = 0xff60;
const MS_CRG: u16 = 0xff63;
const MS_COM: u16 = 0xff64;
const MS_SOT: u16 = 0xff90;
const MS_SOD: u16 = 0xff93;
const MS_EOC: u16 = 0xffd9;

const DEFAULT_COMMENT: &str = "Created by tessera-j2k";

/* ----------------------------------------------------------------------- */
/* parameter resolution                                                    */

pub(crate) fn setup_coding_params(image: &Image, params: &CompressParams) -> Result<CodingParams> {
  params.validate(image)?;

  let (tx0, ty0, tdx, tdy) = if params.tile_size_on {
    (params.tx0, params.ty0, params.tdx, params.tdy)
  } else {
    (0, 0, image.x1, image.y1)
  };
  let tw = ceil_div(image.x1 - tx0, tdx);
  let th = ceil_div(image.y1 - ty0, tdy);
  if tw as u64 * th as u64 > 65535 {
    return Err(Error::InvalidGeometry(format!("{tw}x{th} tiles exceed 65535")));
  }

  let mut csty = params.csty;
  if !params.prcw_init.is_empty() {
    csty |= Csty::PRT;
  }

  let mut tcp = Tcp {
    csty,
    prg: params.prog_order,
    numlayers: params.numlayers,
    rates: {
      let mut r = params.rates.clone();
      r.resize(params.numlayers as usize, 0.0);
      r
    },
    distoratio: {
      let mut d = params.distoratio.clone();
      d.resize(params.numlayers as usize, 0.0);
      d
    },
    mct: params.mct.code(),
    custom_mct: match &params.mct {
      Mct::Custom(m) => Some(m.clone()),
      _ => None,
    },
    tccps: Vec::new(),
  };

  for (compno, comp) in image.comps.iter().enumerate() {
    let numres = params.numresolution;
    let mut tccp = Tccp {
      csty,
      numresolutions: numres,
      cblkw: floor_log2(params.cblockw_init),
      cblkh: floor_log2(params.cblockh_init),
      cblksty: params.cblk_style,
      qmfbid: if params.irreversible { 0 } else { 1 },
      qntsty: if params.irreversible {
        QuantStyle::ScalarExpounded
      } else {
        QuantStyle::NoQuant
      },
      stepsizes: Vec::new(),
      numgbits: NUM_GUARD_BITS,
      roishift: match params.roi_compno {
        Some(c) if c as usize == compno => params.roi_shift as i32,
        _ => 0,
      },
      prcw: Vec::new(),
      prch: Vec::new(),
    };
    if csty.contains(Csty::PRT) {
      // the first precinct entry applies to the highest resolution
      for resno in 0..numres {
        let idx = ((numres - 1 - resno) as usize).min(params.prcw_init.len() - 1);
        tccp.prcw.push(params.prcw_init[idx]);
        tccp.prch.push(params.prch_init[idx]);
      }
    }
    dwt::calc_explicit_stepsizes(&mut tccp, comp.prec);
    tcp.tccps.push(tccp);
  }

  let numtiles = (tw * th) as usize;
  Ok(CodingParams {
    tx0,
    ty0,
    tdx,
    tdy,
    tw,
    th,
    disto_alloc: params.disto_alloc,
    fixed_quality: params.fixed_quality,
    rate_control: params.rate_control,
    max_cs_size: params.max_cs_size,
    max_comp_size: params.max_comp_size,
    rsiz: params.rsiz,
    reduce: 0,
    layer_cap: 0,
    tcps: vec![tcp; numtiles],
  })
}

#[cfg(test)]
pub(crate) fn coding_params_for_tests(image: &Image, params: &CompressParams) -> CodingParams {
  setup_coding_params(image, params).unwrap()
}

/* ----------------------------------------------------------------------- */
/* marker writers                                                          */

fn write_siz(s: &mut ByteStream<'_>, image: &Image, cp: &CodingParams) -> Result<()> {
  s.write_u16(MS_SIZ)?;
  s.write_u16(38 + 3 * image.numcomps() as u16)?;
  s.write_u16(cp.rsiz)?;
  s.write_u32(image.x1)?;
  s.write_u32(image.y1)?;
  s.write_u32(image.x0)?;
  s.write_u32(image.y0)?;
  s.write_u32(cp.tdx)?;
  s.write_u32(cp.tdy)?;
  s.write_u32(cp.tx0)?;
  s.write_u32(cp.ty0)?;
  s.write_u16(image.numcomps() as u16)?;
  for comp in &image.comps {
    let ssiz = (comp.prec - 1) as u8 | if comp.sgnd { 0x80 } else { 0 };
    s.write_u8(ssiz)?;
    s.write_u8(comp.dx as u8)?;
    s.write_u8(comp.dy as u8)?;
  }
  Ok(())
}

fn write_cod(s: &mut ByteStream<'_>, cp: &CodingParams) -> Result<()> {
  let tcp = &cp.tcps[0];
  let tccp = &tcp.tccps[0];
  let prt = tccp.csty.contains(Csty::PRT);
  let len = 12 + if prt { tccp.numresolutions as u16 } else { 0 };
  s.write_u16(MS_COD)?;
  s.write_u16(len)?;
  s.write_u8(tcp.csty.bits())?;
  s.write_u8(tcp.prg as u8)?;
  s.write_u16(tcp.numlayers as u16)?;
  // custom transforms are configured out of band; only the default
  // transform is signalled
  s.write_u8(u8::from(tcp.mct == 1))?;
  s.write_u8((tccp.numresolutions - 1) as u8)?;
  s.write_u8((tccp.cblkw - 2) as u8)?;
  s.write_u8((tccp.cblkh - 2) as u8)?;
  s.write_u8(tccp.cblksty.bits())?;
  s.write_u8(tccp.qmfbid as u8)?;
  if prt {
    for resno in 0..tccp.numresolutions as usize {
      s.write_u8((tccp.prcw[resno] | (tccp.prch[resno] << 4)) as u8)?;
    }
  }
  Ok(())
}

fn write_qcd(s: &mut ByteStream<'_>, cp: &CodingParams) -> Result<()> {
  let tccp = &cp.tcps[0].tccps[0];
  let numbands = tccp.stepsizes.len() as u16;
  let (len, style) = match tccp.qntsty {
    QuantStyle::NoQuant => (4 + numbands, 0u8),
    QuantStyle::ScalarExpounded => (4 + 2 * numbands, 2u8),
  };
  s.write_u16(MS_QCD)?;
  s.write_u16(len - 1)?;
  s.write_u8(style | (tccp.numgbits as u8) << 5)?;
  for ss in &tccp.stepsizes {
    match tccp.qntsty {
      QuantStyle::NoQuant => s.write_u8((ss.expn as u8) << 3)?,
      QuantStyle::ScalarExpounded => {
        s.write_u16(((ss.expn as u16) << 11) | ss.mant as u16)?
      }
    }
  }
  Ok(())
}

fn write_rgn(s: &mut ByteStream<'_>, compno: u32, roishift: u32) -> Result<()> {
  s.write_u16(MS_RGN)?;
  s.write_u16(5)?;
  s.write_u8(compno as u8)?;
  s.write_u8(0)?; // maxshift method
  s.write_u8(roishift as u8)?;
  Ok(())
}

fn write_com(s: &mut ByteStream<'_>, text: &str) -> Result<()> {
  s.write_u16(MS_COM)?;
  s.write_u16(4 + text.len() as u16)?;
  s.write_u16(1)?; // latin-1 text
  s.write(text.as_bytes())
}

/* ----------------------------------------------------------------------- */
/* marker readers                                                          */

struct MainHeader {
  image_x0: u32,
  image_y0: u32,
  image_x1: u32,
  image_y1: u32,
  comp_params: Vec<(u32, u32, u32, bool)>, // dx, dy, prec, sgnd
  cp: CodingParams,
}

fn read_siz(s: &mut ByteStream<'_>) -> Result<MainHeader> {
  let len = s.read_u16()?;
  if len < 38 {
    return Err(Error::CorruptCodestream(format!("SIZ length {len} too small")));
  }
  let rsiz = s.read_u16()?;
  let x1 = s.read_u32()?;
  let y1 = s.read_u32()?;
  let x0 = s.read_u32()?;
  let y0 = s.read_u32()?;
  let tdx = s.read_u32()?;
  let tdy = s.read_u32()?;
  let tx0 = s.read_u32()?;
  let ty0 = s.read_u32()?;
  let numcomps = s.read_u16()? as u32;
  if x1 <= x0 || y1 <= y0 {
    return Err(Error::CorruptCodestream("SIZ describes an empty image".into()));
  }
  if numcomps == 0 || len as u32 != 38 + 3 * numcomps {
    return Err(Error::CorruptCodestream(format!(
      "SIZ length {len} does not match {numcomps} components"
    )));
  }
  if tdx == 0 || tdy == 0 {
    return Err(Error::CorruptCodestream("SIZ has a zero tile size".into()));
  }
  if tx0 > x0 || ty0 > y0 {
    return Err(Error::CorruptCodestream(
      "tile origin exceeds the image origin".into(),
    ));
  }
  let mut comp_params = Vec::with_capacity(numcomps as usize);
  for _ in 0..numcomps {
    let ssiz = s.read_u8()?;
    let dx = s.read_u8()? as u32;
    let dy = s.read_u8()? as u32;
    if dx == 0 || dy == 0 {
      return Err(Error::CorruptCodestream("zero component subsampling".into()));
    }
    comp_params.push((dx, dy, (ssiz & 0x7f) as u32 + 1, ssiz & 0x80 != 0));
  }
  let tw = ceil_div(x1 - tx0, tdx);
  let th = ceil_div(y1 - ty0, tdy);
  let cp = CodingParams {
    tx0,
    ty0,
    tdx,
    tdy,
    tw,
    th,
    rsiz,
    tcps: vec![
      Tcp {
        tccps: vec![Tccp::default(); numcomps as usize],
        numlayers: 1,
        ..Tcp::default()
      };
      (tw * th) as usize
    ],
    ..CodingParams::default()
  };
  Ok(MainHeader {
    image_x0: x0,
    image_y0: y0,
    image_x1: x1,
    image_y1: y1,
    comp_params,
    cp,
  })
}

fn read_sp_cox(s: &mut ByteStream<'_>, tccp: &mut Tccp, prt: bool) -> Result<u16> {
  let numres = s.read_u8()? as u32 + 1;
  if numres > MAX_RESOLUTIONS {
    return Err(Error::CorruptCodestream(format!(
      "{numres} resolution levels exceed {MAX_RESOLUTIONS}"
    )));
  }
  let cblkw = s.read_u8()? as u32 + 2;
  let cblkh = s.read_u8()? as u32 + 2;
  if !(2..=10).contains(&cblkw) || !(2..=10).contains(&cblkh) || cblkw + cblkh > 12 {
    return Err(Error::CorruptCodestream(format!(
      "codeblock exponents {cblkw}x{cblkh} out of range"
    )));
  }
  let cblksty = s.read_u8()?;
  let qmfbid = s.read_u8()? as u32;
  if qmfbid > 1 {
    return Err(Error::CorruptCodestream(format!("bad transformation {qmfbid}")));
  }
  tccp.numresolutions = numres;
  tccp.cblkw = cblkw;
  tccp.cblkh = cblkh;
  tccp.cblksty = CblkStyle::from_bits_truncate(cblksty);
  tccp.qmfbid = qmfbid;
  let mut read = 5u16;
  tccp.prcw.clear();
  tccp.prch.clear();
  if prt {
    for _ in 0..numres {
      let p = s.read_u8()?;
      tccp.prcw.push((p & 0x0f) as u32);
      tccp.prch.push((p >> 4) as u32);
      read += 1;
    }
  }
  Ok(read)
}

fn read_cod(s: &mut ByteStream<'_>, hdr: &mut MainHeader) -> Result<()> {
  let len = s.read_u16()?;
  let scod = s.read_u8()?;
  let csty = Csty::from_bits_truncate(scod);
  let prg = ProgOrder::from_u8(s.read_u8()?)?;
  let numlayers = s.read_u16()? as u32;
  if numlayers == 0 {
    return Err(Error::CorruptCodestream("COD declares zero layers".into()));
  }
  let mct = s.read_u8()?;
  let mut template = Tccp {
    csty,
    ..Tccp::default()
  };
  let read = read_sp_cox(s, &mut template, csty.contains(Csty::PRT))?;
  if len != 12 + read - 5 {
    return Err(Error::CorruptCodestream(format!("COD length {len} inconsistent")));
  }
  for tcp in hdr.cp.tcps.iter_mut() {
    tcp.csty = csty;
    tcp.prg = prg;
    tcp.numlayers = numlayers;
    tcp.rates = vec![0.0; numlayers as usize];
    tcp.distoratio = vec![0.0; numlayers as usize];
    tcp.mct = mct;
    for tccp in tcp.tccps.iter_mut() {
      let stepsizes = core::mem::take(&mut tccp.stepsizes);
      let roishift = tccp.roishift;
      let numgbits = tccp.numgbits;
      let qntsty = tccp.qntsty;
      *tccp = template.clone();
      tccp.stepsizes = stepsizes;
      tccp.roishift = roishift;
      tccp.numgbits = numgbits;
      tccp.qntsty = qntsty;
    }
  }
  Ok(())
}

fn read_coc(s: &mut ByteStream<'_>, hdr: &mut MainHeader) -> Result<()> {
  let _len = s.read_u16()?;
  let numcomps = hdr.comp_params.len() as u32;
  let compno = if numcomps <= 256 {
    s.read_u8()? as u32
  } else {
    s.read_u16()? as u32
  };
  if compno >= numcomps {
    return Err(Error::CorruptCodestream(format!("COC component {compno} out of range")));
  }
  let scoc = s.read_u8()?;
  let prt = scoc & 0x01 != 0;
  let mut template = Tccp {
    csty: if prt { Csty::PRT } else { Csty::empty() },
    ..Tccp::default()
  };
  read_sp_cox(s, &mut template, prt)?;
  for tcp in hdr.cp.tcps.iter_mut() {
    let tccp = &mut tcp.tccps[compno as usize];
    let stepsizes = core::mem::take(&mut tccp.stepsizes);
    let roishift = tccp.roishift;
    let numgbits = tccp.numgbits;
    let qntsty = tccp.qntsty;
    *tccp = template.clone();
    tccp.stepsizes = stepsizes;
    tccp.roishift = roishift;
    tccp.numgbits = numgbits;
    tccp.qntsty = qntsty;
  }
  Ok(())
}

fn read_quant(s: &mut ByteStream<'_>, len: u16) -> Result<(QuantStyle, u32, Vec<StepSize>)> {
  if len < 4 {
    return Err(Error::CorruptCodestream(format!(
      "quantization segment length {len} too small"
    )));
  }
  let sqcd = s.read_u8()?;
  let numgbits = (sqcd >> 5) as u32;
  let style = sqcd & 0x1f;
  let payload = len as usize - 3;
  let mut stepsizes = Vec::new();
  match style {
    0 => {
      for _ in 0..payload {
        let b = s.read_u8()?;
        stepsizes.push(StepSize { expn: (b >> 3) as i32, mant: 0 });
      }
      Ok((QuantStyle::NoQuant, numgbits, stepsizes))
    }
    2 => {
      if payload % 2 != 0 {
        return Err(Error::CorruptCodestream("odd QCD payload".into()));
      }
      for _ in 0..payload / 2 {
        let v = s.read_u16()?;
        stepsizes.push(StepSize {
          expn: (v >> 11) as i32,
          mant: (v & 0x7ff) as i32,
        });
      }
      Ok((QuantStyle::ScalarExpounded, numgbits, stepsizes))
    }
    1 => Err(Error::Unsupported("scalar-derived quantization".into())),
    _ => Err(Error::CorruptCodestream(format!("bad quantization style {style}"))),
  }
}

fn read_qcd(s: &mut ByteStream<'_>, hdr: &mut MainHeader) -> Result<()> {
  let len = s.read_u16()?;
  let (qntsty, numgbits, stepsizes) = read_quant(s, len)?;
  for tcp in hdr.cp.tcps.iter_mut() {
    for tccp in tcp.tccps.iter_mut() {
      tccp.qntsty = qntsty;
      tccp.numgbits = numgbits;
      tccp.stepsizes = stepsizes.clone();
    }
  }
  Ok(())
}

fn read_qcc(s: &mut ByteStream<'_>, hdr: &mut MainHeader) -> Result<()> {
  let len = s.read_u16()?;
  let numcomps = hdr.comp_params.len() as u32;
  let (compno, used) = if numcomps <= 256 {
    (s.read_u8()? as u32, 1u16)
  } else {
    (s.read_u16()? as u32, 2)
  };
  if compno >= numcomps {
    return Err(Error::CorruptCodestream(format!("QCC component {compno} out of range")));
  }
  let (qntsty, numgbits, stepsizes) = read_quant(s, len.saturating_sub(used))?;
  for tcp in hdr.cp.tcps.iter_mut() {
    let tccp = &mut tcp.tccps[compno as usize];
    tccp.qntsty = qntsty;
    tccp.numgbits = numgbits;
    tccp.stepsizes = stepsizes.clone();
  }
  Ok(())
}

fn read_rgn(s: &mut ByteStream<'_>, hdr: &mut MainHeader) -> Result<()> {
  let _len = s.read_u16()?;
  let numcomps = hdr.comp_params.len() as u32;
  let compno = if numcomps <= 256 {
    s.read_u8()? as u32
  } else {
    s.read_u16()? as u32
  };
  if compno >= numcomps {
    return Err(Error::CorruptCodestream(format!("RGN component {compno} out of range")));
  }
  let srgn = s.read_u8()?;
  if srgn != 0 {
    return Err(Error::Unsupported(format!("RGN style {srgn}")));
  }
  let shift = s.read_u8()? as i32;
  for tcp in hdr.cp.tcps.iter_mut() {
    tcp.tccps[compno as usize].roishift = shift;
  }
  Ok(())
}

fn skip_segment(s: &mut ByteStream<'_>) -> Result<()> {
  let len = s.read_u16()?;
  if len < 2 {
    return Err(Error::CorruptCodestream(format!("marker length {len} < 2")));
  }
  s.skip(len as u64 - 2)
}

/* ----------------------------------------------------------------------- */
/* codec                                                                   */

/// The codec instance: owns the optional worker pool handle.
pub struct Codec {
  pool: Option<rayon::ThreadPool>,
}

impl Default for Codec {
  fn default() -> Self {
    Codec::new()
  }
}

impl Codec {
  /// A codec running every stage on the calling thread.
  pub fn new() -> Self {
    Codec { pool: None }
  }

  /// A codec with its own worker pool; `threads == 0` sizes the pool to
  /// the hardware concurrency.
  pub fn with_threads(threads: usize) -> Result<Self> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(threads)
      .build()
      .map_err(|e| Error::InvalidParameter(format!("thread pool: {e}")))?;
    Ok(Codec { pool: Some(pool) })
  }

  /// A codec on a caller-provided pool.
  pub fn with_pool(pool: rayon::ThreadPool) -> Self {
    Codec { pool: Some(pool) }
  }

  /// Encode `image` as a raw codestream.
  pub fn encode(
    &self,
    image: &Image,
    params: &CompressParams,
    stream: &mut ByteStream<'_>,
  ) -> Result<()> {
    let cp = setup_coding_params(image, params)?;

    stream.write_u16(MS_SOC)?;
    write_siz(stream, image, &cp)?;
    write_cod(stream, &cp)?;
    write_qcd(stream, &cp)?;
    if let Some(compno) = params.roi_compno {
      if params.roi_shift > 0 {
        write_rgn(stream, compno, params.roi_shift)?;
      }
    }
    write_com(stream, params.comment.as_deref().unwrap_or(DEFAULT_COMMENT))?;

    for tileno in 0..cp.numtiles() {
      let body = tcd::encode_tile(image, &cp, tileno, self.pool.as_ref())?;
      stream.write_u16(MS_SOT)?;
      stream.write_u16(10)?;
      stream.write_u16(tileno as u16)?;
      stream.write_u32(12 + 2 + body.len() as u32)?; // Psot
      stream.write_u8(0)?; // TPsot
      stream.write_u8(1)?; // TNsot
      stream.write_u16(MS_SOD)?;
      stream.write(&body)?;
    }
    stream.write_u16(MS_EOC)?;
    stream.flush()
  }

  /// Decode a raw codestream into an image.
  pub fn decode(
    &self,
    stream: &mut ByteStream<'_>,
    params: &DecompressParams,
  ) -> Result<Image> {
    if stream.read_u16()? != MS_SOC {
      return Err(Error::CorruptCodestream("missing SOC marker".into()));
    }
    if stream.read_u16()? != MS_SIZ {
      return Err(Error::CorruptCodestream("SIZ must follow SOC".into()));
    }
    let mut hdr = read_siz(stream)?;
    hdr.cp.reduce = params.cp_reduce;
    hdr.cp.layer_cap = params.cp_layer;

    let mut saw_cod = false;
    let first_sot;
    loop {
      let marker = stream.read_u16()?;
      match marker {
        MS_COD => {
          read_cod(stream, &mut hdr)?;
          saw_cod = true;
        }
        MS_COC => read_coc(stream, &mut hdr)?,
        MS_QCD => read_qcd(stream, &mut hdr)?,
        MS_QCC => read_qcc(stream, &mut hdr)?,
        MS_RGN => read_rgn(stream, &mut hdr)?,
        MS_POC => {
          return Err(Error::Unsupported(
            "POC: progression changes are not implemented".into(),
          ))
        }
        MS_PPM => {
          return Err(Error::Unsupported("PPM: packed packet headers".into()))
        }
        MS_TLM | MS_PLM | MS_CRG | MS_COM => skip_segment(stream)?,
        MS_SOT => {
          first_sot = true;
          break;
        }
        MS_EOC => {
          first_sot = false;
          break;
        }
        m if m & 0xff00 == 0xff00 => {
          log::warn!("skipping unknown marker {m:#06x}");
          skip_segment(stream)?;
        }
        m => {
          return Err(Error::CorruptCodestream(format!(
            "expected a marker, found {m:#06x}"
          )))
        }
      }
    }
    if !saw_cod {
      return Err(Error::CorruptCodestream("main header lacks COD".into()));
    }

    // collect tile-part payloads
    let numtiles = hdr.cp.numtiles() as usize;
    let mut tile_data: Vec<Vec<u8>> = vec![Vec::new(); numtiles];
    let mut more = first_sot;
    while more {
      match self.read_tile_part(stream, &mut tile_data) {
        Ok(cont) => more = cont,
        Err(Error::CorruptCodestream(msg)) => {
          log::warn!("codestream ends early: {msg}");
          break;
        }
        Err(e) => return Err(e),
      }
    }

    // build the output image at the reduced resolution
    let reduce = hdr.cp.reduce;
    let mut comps = Vec::with_capacity(hdr.comp_params.len());
    for &(dx, dy, prec, sgnd) in &hdr.comp_params {
      let x0 = ceil_div_pow2(ceil_div(hdr.image_x0, dx), reduce);
      let y0 = ceil_div_pow2(ceil_div(hdr.image_y0, dy), reduce);
      let x1 = ceil_div_pow2(ceil_div(hdr.image_x1, dx), reduce);
      let y1 = ceil_div_pow2(ceil_div(hdr.image_y1, dy), reduce);
      let mut comp = ImageComp {
        dx,
        dy,
        w: x1 - x0,
        h: y1 - y0,
        x0: hdr.image_x0,
        y0: hdr.image_y0,
        prec,
        sgnd,
        resno_decoded: 0,
        factor: reduce,
        data: Vec::new(),
      };
      comp.alloc_data()?;
      comps.push(comp);
    }
    let mut image = Image {
      x0: hdr.image_x0,
      y0: hdr.image_y0,
      x1: hdr.image_x1,
      y1: hdr.image_y1,
      comps,
    };

    for (tileno, data) in tile_data.iter().enumerate() {
      if data.is_empty() {
        continue;
      }
      tcd::decode_tile(
        &mut image,
        &hdr.cp,
        tileno as u32,
        data,
        params.custom_mct.as_ref(),
        self.pool.as_ref(),
      )?;
      for comp in image.comps.iter_mut() {
        comp.resno_decoded =
          hdr.cp.tcps[tileno].tccps[0].numresolutions - reduce - 1;
      }
    }
    Ok(image)
  }

  /// Read one SOT..SOD tile part (the SOT marker itself is already
  /// consumed). Returns whether another tile part follows.
  fn read_tile_part(
    &self,
    stream: &mut ByteStream<'_>,
    tile_data: &mut [Vec<u8>],
  ) -> Result<bool> {
    let lsot = stream.read_u16()?;
    if lsot != 10 {
      return Err(Error::CorruptCodestream(format!("Lsot {lsot} != 10")));
    }
    let tileno = stream.read_u16()? as usize;
    let psot = stream.read_u32()? as u64;
    let _tpsot = stream.read_u8()?;
    let _tnsot = stream.read_u8()?;
    if tileno >= tile_data.len() {
      return Err(Error::CorruptCodestream(format!("tile index {tileno} out of range")));
    }
    if psot == 0 {
      return Err(Error::Unsupported(
        "tile part with unknown length (Psot = 0)".into(),
      ));
    }
    if psot < 14 {
      return Err(Error::CorruptCodestream(format!("Psot {psot} too small")));
    }

    // markers between SOT and SOD
    let mut consumed = 12u64;
    loop {
      let marker = stream.read_u16()?;
      consumed += 2;
      if marker == MS_SOD {
        break;
      }
      if marker & 0xff00 != 0xff00 {
        return Err(Error::CorruptCodestream(format!(
          "expected a marker in the tile header, found {marker:#06x}"
        )));
      }
      log::warn!("skipping tile-header marker {marker:#06x}");
      let len = stream.read_u16()?;
      if len < 2 {
        return Err(Error::CorruptCodestream(format!("marker length {len} < 2")));
      }
      stream.skip(len as u64 - 2)?;
      consumed += len as u64;
    }

    let body_len = psot.checked_sub(consumed).ok_or_else(|| {
      Error::CorruptCodestream(format!("Psot {psot} smaller than the tile header"))
    })? as usize;
    let to_read = match stream.bytes_left() {
      Some(left) => (body_len as u64).min(left) as usize,
      None => body_len,
    };
    let mut body = vec![0u8; to_read];
    let got = stream.read(&mut body)?;
    body.truncate(got);
    tile_data[tileno].extend_from_slice(&body);
    if got < body_len {
      return Err(Error::CorruptCodestream(format!(
        "tile part truncated: wanted {body_len} bytes, got {got}"
      )));
    }

    match stream.read_u16() {
      Ok(MS_SOT) => Ok(true),
      Ok(MS_EOC) => Ok(false),
      Ok(m) => Err(Error::CorruptCodestream(format!(
        "expected SOT or EOC after a tile part, found {m:#06x}"
      ))),
      Err(_) => Err(Error::CorruptCodestream("stream ends without EOC".into())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode_to_vec(image: &Image, params: &CompressParams) -> Vec<u8> {
    let codec = Codec::new();
    let mut stream = ByteStream::from_vec(Vec::new());
    codec.encode(image, params, &mut stream).unwrap();
    stream.into_vec()
  }

  #[test]
  fn codestream_magic_and_eoc() {
    let image = Image::with_dims(16, 16, 1, 8, false).unwrap();
    let bytes = encode_to_vec(&image, &CompressParams::default());
    assert_eq!(&bytes[0..4], &[0xff, 0x4f, 0xff, 0x51]);
    assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xd9]);
  }

  #[test]
  fn main_header_markers_in_order() {
    let image = Image::with_dims(16, 16, 1, 8, false).unwrap();
    let bytes = encode_to_vec(&image, &CompressParams::default());
    // SIZ length covers one component
    let lsiz = u16::from_be_bytes([bytes[6], bytes[7]]);
    assert_eq!(lsiz, 41);
    // COD follows SIZ
    let cod_at = 4 + 2 + lsiz as usize;
    assert_eq!(&bytes[cod_at..cod_at + 2], &[0xff, 0x52]);
  }

  #[test]
  fn missing_soc_is_rejected() {
    let codec = Codec::new();
    let data = [0u8, 1, 2, 3];
    let mut stream = ByteStream::from_slice(&data);
    assert!(matches!(
      codec.decode(&mut stream, &DecompressParams::default()),
      Err(Error::CorruptCodestream(_))
    ));
  }

  #[test]
  fn sot_declares_psot_matching_body() {
    let image = Image::with_dims(16, 16, 1, 8, false).unwrap();
    let bytes = encode_to_vec(&image, &CompressParams::default());
    // find the SOT marker
    let mut i = 2;
    while &bytes[i..i + 2] != [0xff, 0x90] {
      let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
      i += 2 + len;
    }
    let psot = u32::from_be_bytes([bytes[i + 6], bytes[i + 7], bytes[i + 8], bytes[i + 9]]);
    // Psot spans SOT..EOC here (single tile part)
    assert_eq!(i + psot as usize, bytes.len() - 2);
  }
}
