//! Integer helpers shared by the geometry and coding stages.

/// Divide rounding up. `b` must be non-zero.
#[inline]
pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
  ((a as u64 + b as u64 - 1) / b as u64) as u32
}

/// Divide by `2^b` rounding up.
#[inline]
pub(crate) fn ceil_div_pow2(a: u32, b: u32) -> u32 {
  ((a as u64 + (1u64 << b) - 1) >> b) as u32
}

/// Signed divide by `2^b` rounding up.
#[inline]
pub(crate) fn int_ceil_div_pow2(a: i64, b: u32) -> i64 {
  (a + (1i64 << b) - 1) >> b
}

/// Divide by `2^b` rounding down.
#[inline]
pub(crate) fn floor_div_pow2(a: u32, b: u32) -> u32 {
  a >> b
}

/// Position of the highest set bit; `floor_log2(1) == 0`.
/// Callers must not pass zero.
#[inline]
pub(crate) fn floor_log2(a: u32) -> u32 {
  debug_assert!(a > 0);
  31 - a.leading_zeros()
}

/// 13-bit fixed-point multiply used by the irreversible paths.
#[inline]
pub(crate) fn fix_mul(a: i32, b: i32) -> i32 {
  let mut t = a as i64 * b as i64;
  t += 4096;
  debug_assert!(t >> 13 <= i32::MAX as i64);
  debug_assert!(t >> 13 >= i32::MIN as i64);
  (t >> 13) as i32
}

#[inline]
pub(crate) fn clamp_i32(v: i32, lo: i32, hi: i32) -> i32 {
  v.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ceil_div_rounds_up() {
    assert_eq!(ceil_div(0, 3), 0);
    assert_eq!(ceil_div(1, 3), 1);
    assert_eq!(ceil_div(3, 3), 1);
    assert_eq!(ceil_div(4, 3), 2);
    assert_eq!(ceil_div(u32::MAX, 1), u32::MAX);
  }

  #[test]
  fn pow2_divisions() {
    assert_eq!(ceil_div_pow2(17, 4), 2);
    assert_eq!(ceil_div_pow2(16, 4), 1);
    assert_eq!(floor_div_pow2(17, 4), 1);
    assert_eq!(int_ceil_div_pow2(-3, 1), -1);
  }

  #[test]
  fn floor_log2_powers() {
    assert_eq!(floor_log2(1), 0);
    assert_eq!(floor_log2(2), 1);
    assert_eq!(floor_log2(255), 7);
    assert_eq!(floor_log2(256), 8);
  }

  #[test]
  fn fix_mul_identity() {
    assert_eq!(fix_mul(12345, 8192), 12345);
  }
}
