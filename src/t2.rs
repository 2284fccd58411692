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

//! Tier-2: serialisation of coding passes into layered packets and back.

use crate::bio::{BioDecoder, BioEncoder};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::math::floor_log2;
use crate::params::{CblkStyle, CodingParams, Csty, Tcp};
use crate::tcd::{pi_for_tile, DecCblk, DecSeg, DecTile, EncTile};

/// Packet emission mode: rate-control simulation or the final pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum T2Mode {
  ThreshCalc,
  FinalPass,
}

const SOP_MARKER: [u8; 2] = [0xff, 0x91];
const EPH_MARKER: [u8; 2] = [0xff, 0x92];

#[inline]
fn flog2i(v: u32) -> i32 {
  if v == 0 {
    -1
  } else {
    floor_log2(v) as i32
  }
}

fn put_numpasses(bio: &mut BioEncoder, n: u32) {
  match n {
    1 => bio.write(0, 1),
    2 => bio.write(2, 2),
    3..=5 => bio.write(0xc | (n - 3), 4),
    6..=36 => bio.write(0x1e0 | (n - 6), 9),
    _ => bio.write(0xff80 | (n - 37), 16),
  }
}

fn get_numpasses(bio: &mut BioDecoder<'_>) -> u32 {
  if bio.getbit() == 0 {
    return 1;
  }
  if bio.getbit() == 0 {
    return 2;
  }
  let n = bio.read(2);
  if n != 3 {
    return 3 + n;
  }
  let n = bio.read(5);
  if n != 31 {
    return 6 + n;
  }
  37 + bio.read(7)
}

fn put_commacode(bio: &mut BioEncoder, n: i32) {
  for _ in 0..n.max(0) {
    bio.putbit(1);
  }
  bio.putbit(0);
}

fn get_commacode(bio: &mut BioDecoder<'_>) -> u32 {
  let mut n = 0;
  while bio.getbit() != 0 {
    n += 1;
  }
  n
}

/* ----------------------------------------------------------------------- */
/* encoder                                                                 */

/// Emit the packets of the first `maxlayers` layers in progression order.
///
/// Returns `None` when the byte budget (or a component budget) is
/// exceeded, which the rate-control bisection treats as "threshold too
/// low".
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_packets(
  tile: &mut EncTile,
  image: &Image,
  tcp: &Tcp,
  cp: &CodingParams,
  _tileno: u32,
  maxlayers: u32,
  maxlen: usize,
  mode: T2Mode,
) -> Result<Option<Vec<u8>>> {
  let pi = pi_for_tile(tile, image, maxlayers);
  let seq = pi.sequence(tcp.prg);
  let mut out = Vec::new();
  let mut comp_bytes = vec![0usize; tile.comps.len()];
  let mut packet_index = 0u32;
  for pos in seq {
    let before = out.len();
    encode_packet(tile, tcp, pos.compno, pos.resno, pos.precno, pos.layno, packet_index, &mut out)?;
    packet_index = packet_index.wrapping_add(1);
    let written = out.len() - before;
    comp_bytes[pos.compno as usize] += written;
    if out.len() > maxlen {
      return Ok(None);
    }
    if mode == T2Mode::ThreshCalc
      && cp.max_comp_size > 0
      && comp_bytes[pos.compno as usize] > cp.max_comp_size
    {
      return Ok(None);
    }
  }
  Ok(Some(out))
}

#[allow(clippy::too_many_arguments)]
fn encode_packet(
  tile: &mut EncTile,
  tcp: &Tcp,
  compno: u32,
  resno: u32,
  precno: u32,
  layno: u32,
  packet_index: u32,
  out: &mut Vec<u8>,
) -> Result<()> {
  let csty = tcp.csty;
  let tilec = &mut tile.comps[compno as usize];
  let res = &mut tilec.resolutions[resno as usize];

  if csty.contains(Csty::SOP) {
    out.extend_from_slice(&SOP_MARKER);
    out.extend_from_slice(&[0x00, 0x04]);
    out.extend_from_slice(&(packet_index as u16).to_be_bytes());
  }

  // first layer: reset the precinct coding state
  if layno == 0 {
    for band in res.bands.iter_mut() {
      if band.is_empty() {
        continue;
      }
      let numbps = band.numbps;
      let Some(prc) = band.precincts.get_mut(precno as usize) else {
        continue;
      };
      prc.incltree.reset();
      prc.imsbtree.reset();
      for cblkno in 0..prc.cblks.len() {
        let cblk = &mut prc.cblks[cblkno];
        cblk.t2_included = 0;
        debug_assert!(cblk.numbps <= numbps);
        let skip = numbps.saturating_sub(cblk.numbps) as i32;
        prc.imsbtree.set_value(cblkno as u32, skip);
      }
    }
  }

  let mut bio = BioEncoder::new();
  bio.putbit(1); // packet present

  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let Some(prc) = band.precincts.get_mut(precno as usize) else {
      continue;
    };
    // inclusion values for blocks included for the first time
    for cblkno in 0..prc.cblks.len() {
      let cblk = &prc.cblks[cblkno];
      if cblk.t2_included == 0 && cblk.layers[layno as usize].numpasses > 0 {
        prc.incltree.set_value(cblkno as u32, layno as i32);
      }
    }
    for cblkno in 0..prc.cblks.len() {
      let layer = prc.cblks[cblkno].layers[layno as usize];
      let first = prc.cblks[cblkno].t2_included;
      if first == 0 {
        prc.incltree.encode(&mut bio, cblkno as u32, layno as i32 + 1);
      } else {
        bio.putbit(u32::from(layer.numpasses != 0));
      }
      if layer.numpasses == 0 {
        continue;
      }
      if first == 0 {
        prc.cblks[cblkno].numlenbits = 3;
        prc.imsbtree.encode(&mut bio, cblkno as u32, crate::tgt::TAG_MAX);
      }
      put_numpasses(&mut bio, layer.numpasses);

      let cblk = &mut prc.cblks[cblkno];
      // grow the length field across terminated-segment boundaries
      let mut increment = 0i32;
      let mut nump = 0u32;
      let mut len = 0u32;
      for passno in first..first + layer.numpasses {
        let pass = &cblk.passes[passno as usize];
        nump += 1;
        len += pass.len;
        if pass.term || passno == first + layer.numpasses - 1 {
          increment = increment
            .max(flog2i(len) + 1 - (cblk.numlenbits as i32 + flog2i(nump)));
          len = 0;
          nump = 0;
        }
      }
      put_commacode(&mut bio, increment);
      cblk.numlenbits = (cblk.numlenbits as i32 + increment.max(0)) as u32;

      let mut nump = 0u32;
      let mut len = 0u32;
      for passno in first..first + layer.numpasses {
        let pass = &cblk.passes[passno as usize];
        nump += 1;
        len += pass.len;
        if pass.term || passno == first + layer.numpasses - 1 {
          bio.write(len, (cblk.numlenbits as i32 + flog2i(nump)) as u32);
          len = 0;
          nump = 0;
        }
      }
    }
  }
  out.extend_from_slice(&bio.flush());

  if csty.contains(Csty::EPH) {
    out.extend_from_slice(&EPH_MARKER);
  }

  // packet body
  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let Some(prc) = band.precincts.get_mut(precno as usize) else {
      continue;
    };
    for cblk in prc.cblks.iter_mut() {
      let layer = cblk.layers[layno as usize];
      if layer.numpasses == 0 {
        continue;
      }
      let start = layer.start as usize;
      let end = start + layer.len as usize;
      out.extend_from_slice(&cblk.data[start..end]);
      cblk.t2_included += layer.numpasses;
    }
  }
  Ok(())
}

/* ----------------------------------------------------------------------- */
/* decoder                                                                 */

fn init_seg(cblk: &mut DecCblk, cblksty: CblkStyle, first: bool) {
  let maxpasses = if cblksty.contains(CblkStyle::TERMALL) {
    1
  } else if cblksty.contains(CblkStyle::LAZY) {
    if first {
      10
    } else {
      let prev = cblk.segs.last().map(|s| s.maxpasses).unwrap_or(10);
      if prev == 1 || prev == 10 {
        2
      } else {
        1
      }
    }
  } else {
    109
  };
  cblk.segs.push(DecSeg { maxpasses, ..DecSeg::default() });
}

/// Parse every packet of the tile payload in progression order.
pub(crate) fn decode_packets(
  tile: &mut DecTile,
  image: &Image,
  tcp: &Tcp,
  cp: &CodingParams,
  _tileno: u32,
  data: &[u8],
) -> Result<()> {
  let pi = pi_for_tile(tile, image, tcp.numlayers);
  let seq = pi.sequence(tcp.prg);
  let layer_cap = if cp.layer_cap > 0 { cp.layer_cap } else { u32::MAX };
  let mut pos = 0usize;
  for packet in seq {
    let keep = packet.layno < layer_cap;
    let consumed = decode_packet(
      tile,
      tcp,
      packet.compno,
      packet.resno,
      packet.precno,
      packet.layno,
      &data[pos..],
      keep,
    )?;
    pos += consumed;
  }
  Ok(())
}

struct SegAddition {
  band_idx: usize,
  cblkno: usize,
  segno: usize,
  numnewpasses: u32,
  newlen: u32,
}

#[allow(clippy::too_many_arguments)]
fn decode_packet(
  tile: &mut DecTile,
  tcp: &Tcp,
  compno: u32,
  resno: u32,
  precno: u32,
  layno: u32,
  data: &[u8],
  keep: bool,
) -> Result<usize> {
  let csty = tcp.csty;
  let cblksty = tcp.tccps[compno as usize].cblksty;
  let tilec = &mut tile.comps[compno as usize];
  let res = &mut tilec.resolutions[resno as usize];
  let mut p = 0usize;

  if csty.contains(Csty::SOP) {
    if data.len() >= 6 && data[0..2] == SOP_MARKER {
      p += 6;
    } else {
      log::warn!("expected SOP marker before packet (layer {layno})");
    }
  }
  if p >= data.len() {
    return Err(Error::CorruptCodestream("truncated packet header".into()));
  }

  let mut bio = BioDecoder::new(&data[p..]);
  let mut additions: Vec<SegAddition> = Vec::new();
  let present = bio.getbit();
  if present != 0 {
    for band_idx in 0..res.bands.len() {
      let band = &mut res.bands[band_idx];
      if band.is_empty() {
        continue;
      }
      let numbps = band.numbps;
      let Some(prc) = band.precincts.get_mut(precno as usize) else {
        continue;
      };
      for cblkno in 0..prc.cblks.len() {
        let included = if !prc.cblks[cblkno].included {
          prc.incltree.decode(&mut bio, cblkno as u32, layno as i32 + 1)
        } else {
          bio.getbit() != 0
        };
        if !included {
          continue;
        }
        if !prc.cblks[cblkno].included {
          let mut i = 0i32;
          while !prc.imsbtree.decode(&mut bio, cblkno as u32, i + 1) {
            i += 1;
          }
          if i as u32 > numbps {
            return Err(Error::CorruptCodestream(format!(
              "MSB skip {i} exceeds the band bit depth {numbps}"
            )));
          }
          let cblk = &mut prc.cblks[cblkno];
          cblk.numbps = numbps - i as u32;
          cblk.numlenbits = 3;
          cblk.included = true;
          init_seg(cblk, cblksty, true);
        }

        let mut numnewpasses = get_numpasses(&mut bio);
        let increment = get_commacode(&mut bio);
        let cblk = &mut prc.cblks[cblkno];
        cblk.numlenbits += increment;
        if cblk.numlenbits > 32 {
          return Err(Error::CorruptCodestream(format!(
            "segment length field grew to {} bits",
            cblk.numlenbits
          )));
        }

        let mut segno = cblk.segs.len() - 1;
        if cblk.segs[segno].parsed_passes == cblk.segs[segno].maxpasses {
          init_seg(cblk, cblksty, false);
          segno += 1;
        }
        loop {
          let take = {
            let seg = &cblk.segs[segno];
            (seg.maxpasses - seg.parsed_passes).min(numnewpasses)
          };
          if take == 0 {
            return Err(Error::CorruptCodestream(
              "segment accepts no further passes".into(),
            ));
          }
          let bits = cblk.numlenbits as i32 + flog2i(take);
          let newlen = bio.read(bits as u32);
          additions.push(SegAddition {
            band_idx,
            cblkno,
            segno,
            numnewpasses: take,
            newlen,
          });
          numnewpasses -= take;
          if numnewpasses == 0 {
            break;
          }
          init_seg(cblk, cblksty, false);
          segno += 1;
        }
      }
    }
  }
  p += bio.inalign();

  if csty.contains(Csty::EPH) {
    if data.len() >= p + 2 && data[p..p + 2] == EPH_MARKER {
      p += 2;
    } else {
      log::warn!("expected EPH marker after packet header (layer {layno})");
    }
  }

  // the body must be fully present before any state is committed
  let body_len: usize = additions.iter().map(|a| a.newlen as usize).sum();
  if p + body_len > data.len() {
    return Err(Error::CorruptCodestream(format!(
      "truncated packet body: need {body_len} bytes, have {}",
      data.len() - p
    )));
  }
  for add in additions {
    let band = &mut res.bands[add.band_idx];
    let prc = &mut band.precincts[precno as usize];
    let cblk = &mut prc.cblks[add.cblkno];
    let seg = &mut cblk.segs[add.segno];
    seg.parsed_passes += add.numnewpasses;
    if keep {
      seg.numpasses += add.numnewpasses;
      seg.len += add.newlen;
      cblk.data.extend_from_slice(&data[p..p + add.newlen as usize]);
    }
    p += add.newlen as usize;
  }
  Ok(p)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn numpasses_code_roundtrip() {
    for n in [1u32, 2, 3, 5, 6, 20, 36, 37, 100, 164] {
      let mut enc = BioEncoder::new();
      put_numpasses(&mut enc, n);
      let bytes = enc.flush();
      let mut dec = BioDecoder::new(&bytes);
      assert_eq!(get_numpasses(&mut dec), n, "numpasses {n}");
    }
  }

  #[test]
  fn commacode_roundtrip() {
    for n in [0i32, 1, 2, 7] {
      let mut enc = BioEncoder::new();
      put_commacode(&mut enc, n);
      let bytes = enc.flush();
      let mut dec = BioDecoder::new(&bytes);
      assert_eq!(get_commacode(&mut dec) as i32, n, "commacode {n}");
    }
  }

  #[test]
  fn seg_schedule_default_mode() {
    let mut cblk = DecCblk::default();
    init_seg(&mut cblk, CblkStyle::empty(), true);
    assert_eq!(cblk.segs[0].maxpasses, 109);
  }

  #[test]
  fn seg_schedule_lazy_alternates() {
    let mut cblk = DecCblk::default();
    init_seg(&mut cblk, CblkStyle::LAZY, true);
    init_seg(&mut cblk, CblkStyle::LAZY, false);
    init_seg(&mut cblk, CblkStyle::LAZY, false);
    init_seg(&mut cblk, CblkStyle::LAZY, false);
    let maxes: Vec<u32> = cblk.segs.iter().map(|s| s.maxpasses).collect();
    assert_eq!(maxes, vec![10, 2, 1, 2]);
  }

  #[test]
  fn seg_schedule_termall_is_single_pass() {
    let mut cblk = DecCblk::default();
    init_seg(&mut cblk, CblkStyle::TERMALL, true);
    init_seg(&mut cblk, CblkStyle::TERMALL, false);
    assert!(cblk.segs.iter().all(|s| s.maxpasses == 1));
  }
}
