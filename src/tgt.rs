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
   Tag-tree coder interface
==========================================================
*/

use crate::bio::{BioDecoder, BioEncoder};

/// Sentinel for "value not set yet" at reset time; also the threshold
/// that forces a full-value emission.
pub(crate) const TAG_MAX: i32 = 999;
const TAG_UNSET: i32 = TAG_MAX;

#[derive(Debug, Clone, Default)]
struct TagNode {
  parent: Option<u32>,
  value: i32,
  low: i32,
  known: bool,
}

/// Two-dimensional hierarchical min-coder over a leaf grid.
///
/// Nodes live in one flat arena, leaves first, then each reduced level
/// up to the single root. Encoding a leaf emits the unary gap between a
/// node's value and its parent's; decoding replays it.
#[derive(Debug, Clone)]
pub(crate) struct TagTree {
  numleafsh: u32,
  numleafsv: u32,
  nodes: Vec<TagNode>,
}

impl TagTree {
  pub fn new(numleafsh: u32, numleafsv: u32) -> Self {
    // level dimensions, halving until 1x1
    let mut dims = Vec::new();
    let mut w = numleafsh.max(1);
    let mut h = numleafsv.max(1);
    loop {
      dims.push((w, h));
      if w * h <= 1 {
        break;
      }
      w = (w + 1) / 2;
      h = (h + 1) / 2;
    }

    let numnodes: usize = dims.iter().map(|&(w, h)| (w * h) as usize).sum();
    let mut nodes = vec![TagNode::default(); numnodes];

    let mut level_base = 0usize;
    for lvl in 0..dims.len() - 1 {
      let (w, h) = dims[lvl];
      let parent_base = level_base + (w * h) as usize;
      let (pw, _) = dims[lvl + 1];
      for y in 0..h {
        for x in 0..w {
          let idx = level_base + (y * w + x) as usize;
          nodes[idx].parent = Some((parent_base as u32) + (y / 2) * pw + (x / 2));
        }
      }
      level_base = parent_base;
    }

    let mut tree = TagTree { numleafsh, numleafsv, nodes };
    tree.reset();
    tree
  }

  /// Re-dimension if needed, then reset all node state.
  pub fn init(&mut self, numleafsh: u32, numleafsv: u32) {
    if self.numleafsh != numleafsh || self.numleafsv != numleafsv {
      *self = TagTree::new(numleafsh, numleafsv);
    } else {
      self.reset();
    }
  }

  pub fn reset(&mut self) {
    for node in &mut self.nodes {
      node.value = TAG_UNSET;
      node.low = 0;
      node.known = false;
    }
  }

  /// Lower the leaf's value, propagating the minimum up the tree.
  pub fn set_value(&mut self, leafno: u32, value: i32) {
    let mut cur = Some(leafno);
    while let Some(idx) = cur {
      let node = &mut self.nodes[idx as usize];
      if node.value <= value {
        break;
      }
      node.value = value;
      cur = node.parent;
    }
  }

  fn ancestor_path(&self, leafno: u32) -> Vec<u32> {
    // root first
    let mut path = Vec::with_capacity(8);
    let mut cur = Some(leafno);
    while let Some(idx) = cur {
      path.push(idx);
      cur = self.nodes[idx as usize].parent;
    }
    path.reverse();
    path
  }

  /// Emit whether the leaf's value is below `threshold`, reusing bits
  /// already spent on its ancestors.
  pub fn encode(&mut self, bio: &mut BioEncoder, leafno: u32, threshold: i32) {
    let path = self.ancestor_path(leafno);
    let mut low = 0i32;
    for idx in path {
      let node = &mut self.nodes[idx as usize];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold {
        if low >= node.value {
          if !node.known {
            bio.putbit(1);
            node.known = true;
          }
          break;
        }
        bio.putbit(0);
        low += 1;
      }
      node.low = low;
    }
  }

  /// Decode whether the leaf's value is below `threshold`.
  pub fn decode(&mut self, bio: &mut BioDecoder<'_>, leafno: u32, threshold: i32) -> bool {
    let path = self.ancestor_path(leafno);
    let mut value = TAG_UNSET;
    let mut low = 0i32;
    for idx in path {
      let node = &mut self.nodes[idx as usize];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold && low < node.value {
        if bio.getbit() != 0 {
          node.value = low;
        } else {
          low += 1;
        }
      }
      node.low = low;
      value = node.value;
    }
    value < threshold
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(w: u32, h: u32, values: &[i32], threshold: i32) {
    let mut enc_tree = TagTree::new(w, h);
    for (leaf, &v) in values.iter().enumerate() {
      enc_tree.set_value(leaf as u32, v);
    }
    let mut bio = BioEncoder::new();
    for leaf in 0..values.len() {
      enc_tree.encode(&mut bio, leaf as u32, threshold);
    }
    let bytes = bio.flush();

    let mut dec_tree = TagTree::new(w, h);
    let mut dec = BioDecoder::new(&bytes);
    for (leaf, &v) in values.iter().enumerate() {
      let below = dec_tree.decode(&mut dec, leaf as u32, threshold);
      assert_eq!(below, v < threshold, "leaf {leaf} value {v} thr {threshold}");
    }
  }

  #[test]
  fn single_leaf() {
    roundtrip(1, 1, &[0], 1);
    roundtrip(1, 1, &[3], 2);
  }

  #[test]
  fn small_grid_thresholds() {
    let values = [1, 0, 2, 3, 0, 1, 4, 2, 1, 0, 0, 5];
    for thr in 1..=6 {
      roundtrip(4, 3, &values, thr);
    }
  }

  #[test]
  fn one_shot_encode_incremental_decode() {
    // the tier-2 MSB pattern: encode fully, decode by raising the
    // threshold until the leaf answers
    let mut enc_tree = TagTree::new(2, 2);
    let values = [2, 0, 1, 3];
    for (leaf, &v) in values.iter().enumerate() {
      enc_tree.set_value(leaf as u32, v);
    }
    let mut bio = BioEncoder::new();
    for leaf in 0..4u32 {
      enc_tree.encode(&mut bio, leaf, TAG_UNSET);
    }
    let bytes = bio.flush();

    let mut dec_tree = TagTree::new(2, 2);
    let mut dec = BioDecoder::new(&bytes);
    for leaf in 0..4u32 {
      let mut decoded = 0;
      while !dec_tree.decode(&mut dec, leaf, decoded + 1) {
        decoded += 1;
      }
      assert_eq!(decoded, values[leaf as usize]);
    }
  }

  #[test]
  fn random_inclusion_pattern_roundtrip() {
    // deterministic pseudo-random layer-of-first-inclusion pattern
    let w = 7;
    let h = 5;
    let mut seed = 0x1234_5678u32;
    let values: Vec<i32> = (0..w * h)
      .map(|_| {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        ((seed >> 16) % 8) as i32
      })
      .collect();
    for thr in [1, 3, 8] {
      roundtrip(w, h, &values, thr);
    }
  }
}
