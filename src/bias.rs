// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Per-QP bias tables for the motion-estimation hardware.
//!
//! For every QP in the codec's range this derives the DC scalers, the
//! QP-to-Lambda mapping, and from Lambda the skip-vector, inter-MB and
//! intra-16 bias values, emitted as register writes to the search engine.
//! The tables are re-emitted once per core per picture, before that
//! picture's first encode-slice command.

use crate::api::Codec;
use crate::util::clamp;

/// One register write targeting the macroblock/search-engine block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
  pub offset: u32,
  pub value: u32,
}

// Register table bases inside the search-engine block (wire ABI).
const REG_DC_SCALE_TABLE: u32 = 0x0180;
const REG_SKIP_BIAS_TABLE: u32 = 0x0200;
const REG_INTER_BIAS_TABLE: u32 = 0x0300;
const REG_INTRA16_BIAS_TABLE: u32 = 0x0400;

const SKIP_VECTOR_CONSTANT: u32 = 6;

/// Scale applied on top of the skip-vector constant; the firmware selects
/// the wider scale for high-motion content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipScale {
  X12,
  X24,
}

impl SkipScale {
  const fn factor(self) -> u32 {
    match self {
      SkipScale::X12 => 12,
      SkipScale::X24 => 24,
    }
  }
}

/// `round(0.85 * 2^((qp - 12) / 3))`, clamped to at least 1, precomputed
/// for the H.264 QP range.
const H264_LAMBDA: [u32; 52] = [
  1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 0-9
  1, 1, 1, 1, 1, 2, 2, 3, 3, 4, // 10-19
  5, 7, 9, 11, 14, 17, 22, 27, 34, 43, // 20-29
  54, 69, 86, 109, 137, 173, 218, 274, 345, 435, // 30-39
  548, 691, 870, 1097, 1382, 1741, 2193, 2763, 3482, 4386, // 40-49
  5526, 6963, // 50-51
];

/// Highest valid QP for the codec's quantiser range.
pub const fn max_qp(codec: Codec) -> u32 {
  match codec {
    Codec::H264 => 51,
    _ => 31,
  }
}

/// Luma DC scaler, the four-branch piecewise mapping used by the quantiser
/// hardware.
pub fn dc_scaler_luma(qp: u32) -> u32 {
  if qp <= 4 {
    8
  } else if qp <= 8 {
    2 * qp
  } else if qp <= 24 {
    qp + 8
  } else {
    2 * qp - 16
  }
}

/// Chroma DC scaler.
pub fn dc_scaler_chroma(qp: u32) -> u32 {
  if qp <= 4 {
    8
  } else if qp <= 24 {
    (qp + 13) / 2
  } else {
    qp - 6
  }
}

/// Rate-distortion Lambda for one QP step.
pub fn lambda(codec: Codec, qp: u32) -> u32 {
  debug_assert!(qp <= max_qp(codec));
  match codec {
    Codec::H264 => H264_LAMBDA[qp as usize],
    // Quantiser-scale domain: lambda tracks qp^2 / 2.
    _ => (qp * qp / 2).max(1),
  }
}

/// Skip-vector bias: Lambda scaled by the skip constant and skip scale.
pub fn skip_vector_bias(codec: Codec, qp: u32, scale: SkipScale) -> u32 {
  lambda(codec, qp) * SKIP_VECTOR_CONSTANT * scale.factor()
}

/// Inter-MB bias, a clamped linear function of QP.
pub fn inter_mb_bias(codec: Codec, qp: u32) -> u32 {
  match codec {
    Codec::H264 => clamp(120 * qp as i32 - 960, 0, 5000) as u32,
    _ => clamp(170 * qp as i32 - 512, 0, 4096) as u32,
  }
}

/// Intra-16 bias; only the H.264 search path consumes it.
pub fn intra16_bias(qp: u32) -> u32 {
  let lambda = lambda(Codec::H264, qp);
  (lambda << 6) - (lambda << 2)
}

/// Builds the per-picture register-write sequence for one core.
pub fn build_bias_tables(codec: Codec, scale: SkipScale) -> Vec<RegWrite> {
  let qp_range = max_qp(codec) + 1;
  let mut writes = Vec::with_capacity(qp_range as usize * 4);
  for qp in 0..qp_range {
    writes.push(RegWrite {
      offset: REG_DC_SCALE_TABLE + qp * 4,
      value: (dc_scaler_luma(qp) << 8) | dc_scaler_chroma(qp),
    });
    writes.push(RegWrite {
      offset: REG_SKIP_BIAS_TABLE + qp * 4,
      value: skip_vector_bias(codec, qp, scale),
    });
    writes.push(RegWrite {
      offset: REG_INTER_BIAS_TABLE + qp * 4,
      value: inter_mb_bias(codec, qp),
    });
    if codec == Codec::H264 {
      writes.push(RegWrite {
        offset: REG_INTRA16_BIAS_TABLE + qp * 4,
        value: intra16_bias(qp),
      });
    }
  }
  writes
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn dc_scaler_breakpoints() {
    assert_eq!(dc_scaler_luma(0), 8);
    assert_eq!(dc_scaler_luma(4), 8);
    assert_eq!(dc_scaler_luma(5), 10);
    assert_eq!(dc_scaler_luma(8), 16);
    assert_eq!(dc_scaler_luma(9), 17);
    assert_eq!(dc_scaler_luma(24), 32);
    assert_eq!(dc_scaler_luma(25), 34);
    assert_eq!(dc_scaler_chroma(4), 8);
    assert_eq!(dc_scaler_chroma(5), 9);
    assert_eq!(dc_scaler_chroma(24), 18);
    assert_eq!(dc_scaler_chroma(25), 19);
  }

  #[test]
  fn dc_scaler_monotonic() {
    for codec in [Codec::H264, Codec::Mpeg4] {
      for qp in 1..=max_qp(codec) {
        assert!(dc_scaler_luma(qp) >= dc_scaler_luma(qp - 1));
        assert!(dc_scaler_chroma(qp) >= dc_scaler_chroma(qp - 1));
      }
    }
  }

  #[test]
  fn lambda_monotonic() {
    for codec in [Codec::H264, Codec::H263, Codec::Mpeg4] {
      for qp in 1..=max_qp(codec) {
        assert!(lambda(codec, qp) >= lambda(codec, qp - 1));
      }
    }
  }

  #[test]
  fn lambda_reference_points() {
    // Doubling every three QP steps from the 0.85 base.
    assert_eq!(lambda(Codec::H264, 12), 1);
    assert_eq!(lambda(Codec::H264, 21), 7);
    assert_eq!(lambda(Codec::H264, 30), 54);
    assert_eq!(lambda(Codec::H264, 51), 6963);
    assert_eq!(lambda(Codec::Mpeg4, 10), 50);
    assert_eq!(lambda(Codec::Mpeg4, 31), 480);
  }

  #[test]
  fn intra16_bias_is_60_lambda() {
    for qp in 0..=51 {
      assert_eq!(intra16_bias(qp), 60 * lambda(Codec::H264, qp));
    }
  }

  #[test]
  fn skip_scale_factors() {
    let qp = 30;
    assert_eq!(
      skip_vector_bias(Codec::H264, qp, SkipScale::X24),
      2 * skip_vector_bias(Codec::H264, qp, SkipScale::X12)
    );
  }

  #[test]
  fn table_sizes_per_codec() {
    assert_eq!(build_bias_tables(Codec::H264, SkipScale::X12).len(), 52 * 4);
    assert_eq!(build_bias_tables(Codec::Mpeg4, SkipScale::X12).len(), 32 * 3);
    assert_eq!(build_bias_tables(Codec::H263, SkipScale::X24).len(), 32 * 3);
  }
}
