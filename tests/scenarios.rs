//! End-to-end scenarios over the full codec surface.

use tessera_j2k::{
  ByteStream, Codec, CompressParams, Csty, CustomMct, DecompressParams, Image, Mct,
};

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

fn count_marker(bytes: &[u8], marker: [u8; 2]) -> usize {
  bytes.windows(2).filter(|w| *w == marker).count()
}

#[test]
fn all_zero_image_roundtrip() {
  // 256x256, 1 component, 8-bit, all zeros, reversible, 1 layer
  let image = Image::with_dims(256, 256, 1, 8, false).unwrap();
  let bytes = encode(&image, &CompressParams::default());
  assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xd9]);
  assert_eq!(count_marker(&bytes, [0xff, 0xd9]), 1);

  let decoded = decode(&bytes, &DecompressParams::default());
  assert!(decoded.comps[0].data.iter().all(|&v| v == 0));
}

#[test]
fn large_tiled_irreversible_quality_target() {
  // 2000x2000, 3 components, pseudo-random bytes, 1000x1000 tiles,
  // irreversible, 1 layer at a 20 dB PSNR target
  let mut image = Image::with_dims(2000, 2000, 3, 8, false).unwrap();
  for comp in image.comps.iter_mut() {
    for (i, v) in comp.data.iter_mut().enumerate() {
      *v = (i & 0xff) as i32;
    }
  }
  let params = CompressParams {
    tile_size_on: true,
    tdx: 1000,
    tdy: 1000,
    irreversible: true,
    numlayers: 1,
    distoratio: vec![20.0],
    fixed_quality: true,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);
  // four tile parts
  assert_eq!(count_marker(&bytes, [0xff, 0x90]), 4);

  let decoded = decode(&bytes, &DecompressParams::default());
  let mut sse = 0f64;
  let mut n = 0f64;
  for (ca, cb) in image.comps.iter().zip(&decoded.comps) {
    for (a, b) in ca.data.iter().zip(&cb.data) {
      let d = (a - b) as f64;
      sse += d * d;
      n += 1.0;
    }
  }
  let mse = sse / n;
  let psnr = 10.0 * (255.0f64 * 255.0 / mse.max(1e-12)).log10();
  assert!(psnr >= 19.0, "quality target missed: {psnr:.2} dB");
}

#[test]
fn layered_checkerboard_with_rate_targets() {
  // 64x64, 12-bit signed checkerboard, reversible, 3 layers
  let mut image = Image::with_dims(64, 64, 1, 12, true).unwrap();
  for y in 0..64usize {
    for x in 0..64usize {
      image.comps[0].data[y * 64 + x] = if (x + y) % 2 == 0 { 2047 } else { -2048 };
    }
  }
  let params = CompressParams {
    numlayers: 3,
    rates: vec![0.1, 0.5, 0.0],
    disto_alloc: true,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);

  // the final layer has no target: full decode is exact
  let full = decode(&bytes, &DecompressParams::default());
  assert_eq!(image.comps[0].data, full.comps[0].data);

  // the first layer respects its byte budget (10% of the uncompressed
  // size) and still decodes cleanly
  let single_layer = CompressParams {
    numlayers: 1,
    rates: vec![0.1],
    disto_alloc: true,
    ..CompressParams::default()
  };
  let truncated = encode(&image, &single_layer);
  let uncompressed = 64 * 64 * 2; // 12-bit samples stored in two bytes
  assert!(
    truncated.len() <= uncompressed / 10 + 256,
    "layer-0 stream is {} bytes",
    truncated.len()
  );
  let _ = decode(&truncated, &DecompressParams::default());
}

#[test]
fn tile_boundary_alignment() {
  // 513x513 with 256x256 tiles: a 3x3 grid whose right and bottom tiles
  // are a single sample wide/tall
  let mut image = Image::with_dims(513, 513, 1, 8, false).unwrap();
  for (i, v) in image.comps[0].data.iter_mut().enumerate() {
    *v = ((i * 31) & 0xff) as i32;
  }
  let params = CompressParams {
    tile_size_on: true,
    tdx: 256,
    tdy: 256,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);
  assert_eq!(count_marker(&bytes, [0xff, 0x90]), 9);

  let decoded = decode(&bytes, &DecompressParams::default());
  assert_eq!(image.comps[0].data, decoded.comps[0].data);
}

#[test]
fn identity_custom_mct_is_transparent() {
  let mut image = Image::with_dims(16, 16, 3, 8, false).unwrap();
  for (compno, comp) in image.comps.iter_mut().enumerate() {
    for (i, v) in comp.data.iter_mut().enumerate() {
      *v = ((i + compno * 7) & 0xff) as i32;
    }
  }
  let identity = CustomMct {
    forward: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    inverse: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    shifts: vec![0, 0, 0],
  };
  let with_mct = CompressParams {
    mct: Mct::Custom(identity),
    ..CompressParams::default()
  };
  let without = CompressParams::default();
  assert_eq!(encode(&image, &with_mct), encode(&image, &without));
}

#[test]
fn truncated_codestream_decodes_cleanly() {
  let mut image = Image::with_dims(64, 64, 1, 8, false).unwrap();
  for (i, v) in image.comps[0].data.iter_mut().enumerate() {
    *v = ((i * 17) & 0xff) as i32;
  }
  // SOP markers delimit the packets, so the cut lands exactly at the
  // end of the third one
  let params = CompressParams {
    numlayers: 3,
    rates: vec![0.05, 0.2, 0.0],
    disto_alloc: true,
    numresolution: 3,
    csty: Csty::SOP,
    ..CompressParams::default()
  };
  let bytes = encode(&image, &params);

  let mut sop_positions = Vec::new();
  let mut i = 0;
  while i + 1 < bytes.len() {
    if bytes[i] == 0xff && bytes[i + 1] == 0x91 {
      sop_positions.push(i);
    }
    i += 1;
  }
  assert!(sop_positions.len() > 3, "expected several packets");
  let cut = sop_positions[3];

  let codec = Codec::new();
  let mut stream = ByteStream::from_slice(&bytes[..cut]);
  let decoded = codec.decode(&mut stream, &DecompressParams::default()).unwrap();
  assert_eq!(decoded.comps[0].w, 64);
  assert_eq!(decoded.comps[0].h, 64);
  // the samples reachable from three packets are bounded by the range
  for &v in &decoded.comps[0].data {
    assert!((0..=255).contains(&v));
  }
}
