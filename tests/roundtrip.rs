//! Whole-pipeline round-trip properties: lossless reconstruction,
//! determinism, progression-order equivalence, layered refinement.

use tessera_j2k::{
  ByteStream, CblkStyle, Codec, CompressParams, Csty, DecompressParams, Image, Mct, ProgOrder,
  RateControl,
};

fn fill_pattern(image: &mut Image, seed: u32) {
  for (compno, comp) in image.comps.iter_mut().enumerate() {
    let max = (1i64 << comp.prec) - 1;
    let mut state = seed.wrapping_add(compno as u32).wrapping_mul(0x9e37_79b9) | 1;
    for v in comp.data.iter_mut() {
      state ^= state << 13;
      state ^= state >> 17;
      state ^= state << 5;
      let raw = (state as i64) & max;
      let val = if comp.sgnd { raw - (max + 1) / 2 } else { raw };
      *v = val as i32;
    }
  }
}

fn encode(image: &Image, params: &CompressParams) -> Vec<u8> {
  let codec = Codec::new();
  let mut stream = ByteStream::from_vec(Vec::new());
  codec.encode(image, params, &mut stream).unwrap();
  stream.into_vec()
}

fn decode(bytes: &[u8], params: &DecompressParams) -> Image {
  let codec = Codec::new();
  let mut stream = ByteStream::from_slice(bytes);
  codec.decode(&mut stream, params).unwrap()
}

fn assert_images_equal(a: &Image, b: &Image) {
  assert_eq!(a.comps.len(), b.comps.len());
  for (ca, cb) in a.comps.iter().zip(&b.comps) {
    assert_eq!((ca.w, ca.h), (cb.w, cb.h));
    for (i, (&va, &vb)) in ca.data.iter().zip(&cb.data).enumerate() {
      assert_eq!(va, vb, "sample {i} of a {}x{} component", ca.w, ca.h);
    }
  }
}

fn lossless_roundtrip(image: &Image, params: &CompressParams) {
  let bytes = encode(image, params);
  let decoded = decode(&bytes, &DecompressParams::default());
  assert_images_equal(image, &decoded);
}

#[test]
fn lossless_precision_sweep() {
  for prec in [1u32, 4, 8, 12, 16] {
    let mut image = Image::with_dims(37, 29, 1, prec, false).unwrap();
    fill_pattern(&mut image, prec);
    lossless_roundtrip(&image, &CompressParams::default());
  }
}

#[test]
fn lossless_signed_samples() {
  for prec in [4u32, 8, 12] {
    let mut image = Image::with_dims(33, 33, 1, prec, true).unwrap();
    fill_pattern(&mut image, 77 + prec);
    lossless_roundtrip(&image, &CompressParams::default());
  }
}

#[test]
fn lossless_component_sweep() {
  for numcomps in [1u32, 2, 3, 4] {
    let mut image = Image::with_dims(48, 32, numcomps, 8, false).unwrap();
    fill_pattern(&mut image, numcomps);
    lossless_roundtrip(&image, &CompressParams::default());
  }
}

#[test]
fn lossless_resolution_sweep() {
  for numres in [1u32, 2, 4, 6] {
    let mut image = Image::with_dims(61, 45, 1, 8, false).unwrap();
    fill_pattern(&mut image, numres);
    let params = CompressParams {
      numresolution: numres,
      ..CompressParams::default()
    };
    lossless_roundtrip(&image, &params);
  }
}

#[test]
fn lossless_with_default_mct() {
  let mut image = Image::with_dims(40, 40, 3, 8, false).unwrap();
  fill_pattern(&mut image, 5);
  let params = CompressParams {
    mct: Mct::Default,
    ..CompressParams::default()
  };
  lossless_roundtrip(&image, &params);
}

#[test]
fn lossless_small_codeblocks_and_precincts() {
  let mut image = Image::with_dims(128, 128, 1, 8, false).unwrap();
  fill_pattern(&mut image, 9);
  let params = CompressParams {
    numresolution: 3,
    cblockw_init: 16,
    cblockh_init: 16,
    prcw_init: vec![7, 6, 6],
    prch_init: vec![7, 6, 6],
    ..CompressParams::default()
  };
  lossless_roundtrip(&image, &params);
}

#[test]
fn lossless_mode_switches() {
  let switches = [
    CblkStyle::TERMALL,
    CblkStyle::LAZY,
    CblkStyle::LAZY | CblkStyle::TERMALL,
    CblkStyle::VSC,
    CblkStyle::SEGSYM,
    CblkStyle::RESET,
    CblkStyle::PTERM,
  ];
  for sty in switches {
    let mut image = Image::with_dims(64, 64, 1, 8, false).unwrap();
    fill_pattern(&mut image, sty.bits() as u32);
    let params = CompressParams {
      cblk_style: sty,
      numresolution: 3,
      ..CompressParams::default()
    };
    lossless_roundtrip(&image, &params);
  }
}

#[test]
fn lossless_with_sop_eph() {
  let mut image = Image::with_dims(50, 60, 2, 8, false).unwrap();
  fill_pattern(&mut image, 21);
  let params = CompressParams {
    csty: Csty::SOP | Csty::EPH,
    ..CompressParams::default()
  };
  lossless_roundtrip(&image, &params);
}

#[test]
fn encoding_is_deterministic() {
  // identical inputs must yield byte-identical output
  let mut image = Image::with_dims(90, 70, 3, 8, false).unwrap();
  fill_pattern(&mut image, 3);
  let params = CompressParams {
    tile_size_on: true,
    tdx: 48,
    tdy: 48,
    ..CompressParams::default()
  };
  let a = encode(&image, &params);
  let b = encode(&image, &params);
  assert_eq!(a, b);
}

#[test]
fn threaded_encode_matches_single_threaded() {
  let mut image = Image::with_dims(96, 96, 1, 8, false).unwrap();
  fill_pattern(&mut image, 11);
  let params = CompressParams::default();
  let single = encode(&image, &params);

  let codec = Codec::with_threads(4).unwrap();
  let mut stream = ByteStream::from_vec(Vec::new());
  codec.encode(&image, &params, &mut stream).unwrap();
  assert_eq!(single, stream.into_vec());
}

#[test]
fn progression_orders_decode_identically() {
  // all five orders over a multi-resolution, multi-component, multi-precinct layout
  let mut image = Image::with_dims(80, 64, 3, 8, false).unwrap();
  fill_pattern(&mut image, 13);
  let orders = [
    ProgOrder::Lrcp,
    ProgOrder::Rlcp,
    ProgOrder::Rpcl,
    ProgOrder::Pcrl,
    ProgOrder::Cprl,
  ];
  for prog in orders {
    let params = CompressParams {
      prog_order: prog,
      numresolution: 3,
      prcw_init: vec![6, 5, 5],
      prch_init: vec![6, 5, 5],
      ..CompressParams::default()
    };
    let bytes = encode(&image, &params);
    let decoded = decode(&bytes, &DecompressParams::default());
    assert_images_equal(&image, &decoded);
  }
}

#[test]
fn layered_decode_matches_shallow_encode() {
  // decoding layers 0..L equals encoding with numlayers = L
  let mut image = Image::with_dims(64, 64, 1, 8, false).unwrap();
  fill_pattern(&mut image, 31);

  let deep = CompressParams {
    numlayers: 3,
    rates: vec![0.05, 0.2, 0.0],
    disto_alloc: true,
    ..CompressParams::default()
  };
  let shallow = CompressParams {
    numlayers: 1,
    rates: vec![0.05],
    disto_alloc: true,
    ..CompressParams::default()
  };

  let deep_bytes = encode(&image, &deep);
  let shallow_bytes = encode(&image, &shallow);

  let capped = decode(
    &deep_bytes,
    &DecompressParams { cp_layer: 1, ..DecompressParams::default() },
  );
  let reference = decode(&shallow_bytes, &DecompressParams::default());
  assert_images_equal(&reference, &capped);
}

#[test]
fn rate_targets_bound_the_codestream() {
  // the emitted bytes honour the layer budget
  let mut image = Image::with_dims(128, 128, 1, 8, false).unwrap();
  fill_pattern(&mut image, 41);
  for rate in [0.05f32, 0.1, 0.25] {
    for algorithm in [RateControl::Simple, RateControl::Feasible] {
      let params = CompressParams {
        numlayers: 1,
        rates: vec![rate],
        disto_alloc: true,
        rate_control: algorithm,
        ..CompressParams::default()
      };
      let bytes = encode(&image, &params);
      let budget = (128.0 * 128.0 * rate) as usize;
      // packets must fit the budget; the main header is small and fixed
      assert!(
        bytes.len() <= budget + 256,
        "rate {rate}: {} bytes exceed budget {budget}",
        bytes.len()
      );
      // and the truncated stream still decodes
      let _ = decode(&bytes, &DecompressParams::default());
    }
  }
}

#[test]
fn reduced_resolution_decode() {
  let mut image = Image::with_dims(64, 64, 1, 8, false).unwrap();
  fill_pattern(&mut image, 55);
  let params = CompressParams {
    numresolution: 4,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);
  for reduce in [1u32, 2] {
    let decoded = decode(
      &bytes,
      &DecompressParams { cp_reduce: reduce, ..DecompressParams::default() },
    );
    assert_eq!(decoded.comps[0].w, 64 >> reduce);
    assert_eq!(decoded.comps[0].h, 64 >> reduce);
    assert_eq!(decoded.comps[0].factor, reduce);
  }
}

#[test]
fn roi_shift_roundtrip() {
  let mut image = Image::with_dims(48, 48, 2, 8, false).unwrap();
  fill_pattern(&mut image, 67);
  let params = CompressParams {
    roi_compno: Some(0),
    roi_shift: 4,
    ..CompressParams::default()
  };
  lossless_roundtrip(&image, &params);
}

#[test]
fn irreversible_roundtrip_quality() {
  let mut image = Image::with_dims(64, 64, 1, 8, false).unwrap();
  // smooth ramp: the 9/7 path should reproduce it closely
  for (i, v) in image.comps[0].data.iter_mut().enumerate() {
    *v = ((i % 64) as i32 + (i / 64) as i32) & 0xff;
  }
  let params = CompressParams {
    irreversible: true,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);
  let decoded = decode(&bytes, &DecompressParams::default());
  let mut sse = 0f64;
  for (a, b) in image.comps[0].data.iter().zip(&decoded.comps[0].data) {
    let d = (a - b) as f64;
    sse += d * d;
  }
  let mse = sse / (64.0 * 64.0);
  let psnr = 10.0 * (255.0f64 * 255.0 / mse.max(1e-12)).log10();
  assert!(psnr > 35.0, "irreversible pipeline too lossy: {psnr:.2} dB");
}
