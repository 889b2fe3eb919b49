// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Per-macroblock "in-params" for the motion-estimation hardware:
//! neighbor-availability flags and search-window geometry, computed
//! row-by-row across the picture and stored double-buffered (intra vs
//! inter bank) so the next picture can reuse this picture's layout without
//! moving data.

use crate::api::Codec;
use crate::params::SliceParams;
use crate::util::clamp;

pub const MB_EDGE_LEFT: u32 = 1 << 0;
pub const MB_EDGE_RIGHT: u32 = 1 << 1;
pub const MB_EDGE_TOP: u32 = 1 << 2;
pub const MB_EDGE_BOTTOM: u32 = 1 << 3;
pub const MB_SLICE_TOP: u32 = 1 << 4;
pub const MB_SLICE_BOTTOM: u32 = 1 << 5;
pub const MB_INTRA: u32 = 1 << 6;

/// Search-window half-extents in pixels, fixed per session at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchGeometry {
  pub range_x: i32,
  pub range_y: i32,
}

impl SearchGeometry {
  pub fn new(codec: Codec) -> Self {
    match codec {
      // The H.264 pipeline runs the wide search.
      Codec::H264 => SearchGeometry { range_x: 48, range_y: 24 },
      _ => SearchGeometry { range_x: 16, range_y: 16 },
    }
  }
}

/// In-params for one macroblock, packed to the two words the hardware
/// fetches per MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbInParams {
  pub flags: u32,
  pub search_min_x: i32,
  pub search_max_x: i32,
  pub search_min_y: i32,
  pub search_max_y: i32,
}

impl MbInParams {
  /// Word 0 carries the control bitfield, word 1 the window offsets as
  /// signed bytes.
  pub fn pack(&self) -> [u32; 2] {
    let pack_byte = |v: i32| (v as i8) as u8 as u32;
    [
      self.flags,
      pack_byte(self.search_min_x)
        | (pack_byte(self.search_max_x) << 8)
        | (pack_byte(self.search_min_y) << 16)
        | (pack_byte(self.search_max_y) << 24),
    ]
  }
}

/// Double-buffered neighbor-parameter storage.
#[derive(Debug)]
pub struct MbParamStore {
  width_mbs: u32,
  height_mbs: u32,
  intra_bank: Vec<MbInParams>,
  inter_bank: Vec<MbInParams>,
}

fn slice_bounds_for_row(slices: &[SliceParams], mb_y: u32) -> (u32, u32) {
  for slice in slices {
    let end = slice.start_row + slice.height_in_rows;
    if mb_y >= slice.start_row && mb_y < end {
      return (slice.start_row, end - 1);
    }
  }
  // Rows not covered by any slice behave as a single-slice picture.
  (0, u32::MAX)
}

impl MbParamStore {
  pub fn new(width_mbs: u32, height_mbs: u32) -> Self {
    let len = (width_mbs * height_mbs) as usize;
    MbParamStore {
      width_mbs,
      height_mbs,
      intra_bank: vec![MbInParams::default(); len],
      inter_bank: vec![MbInParams::default(); len],
    }
  }

  /// Fills one bank row-by-row across the full picture width.
  pub fn build(
    &mut self, geom: SearchGeometry, slices: &[SliceParams], intra: bool,
  ) {
    let width_mbs = self.width_mbs;
    let height_mbs = self.height_mbs;
    let bank = if intra { &mut self.intra_bank } else { &mut self.inter_bank };
    for mb_y in 0..height_mbs {
      let (slice_top, slice_bottom) = slice_bounds_for_row(slices, mb_y);
      for mb_x in 0..width_mbs {
        let mut flags = 0;
        if mb_x == 0 {
          flags |= MB_EDGE_LEFT;
        }
        if mb_x == width_mbs - 1 {
          flags |= MB_EDGE_RIGHT;
        }
        if mb_y == 0 {
          flags |= MB_EDGE_TOP;
        }
        if mb_y == height_mbs - 1 {
          flags |= MB_EDGE_BOTTOM;
        }
        if mb_y == slice_top {
          flags |= MB_SLICE_TOP;
        }
        if mb_y == slice_bottom {
          flags |= MB_SLICE_BOTTOM;
        }
        if intra {
          flags |= MB_INTRA;
        }

        // Clamp the window so it never reaches outside the picture.
        let px = (mb_x * 16) as i32;
        let py = (mb_y * 16) as i32;
        let max_px = ((width_mbs - 1) * 16) as i32;
        let max_py = ((height_mbs - 1) * 16) as i32;
        let params = MbInParams {
          flags,
          search_min_x: clamp(-geom.range_x, -px, 0),
          search_max_x: clamp(geom.range_x, 0, max_px - px),
          search_min_y: clamp(-geom.range_y, -py, 0),
          search_max_y: clamp(geom.range_y, 0, max_py - py),
        };
        bank[(mb_y * width_mbs + mb_x) as usize] = params;
      }
    }
  }

  pub fn bank(&self, intra: bool) -> &[MbInParams] {
    if intra {
      &self.intra_bank
    } else {
      &self.inter_bank
    }
  }

  /// Packed words for upload into the neighbor-parameter region.
  pub fn bank_bytes(&self, intra: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(self.bank(intra).len() * 8);
    for mb in self.bank(intra) {
      for word in mb.pack() {
        out.extend_from_slice(&word.to_le_bytes());
      }
    }
    out
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn two_slices() -> Vec<SliceParams> {
    vec![
      SliceParams {
        start_row: 0,
        height_in_rows: 2,
        intra: false,
        disable_deblocking_filter_idc: 0,
      },
      SliceParams {
        start_row: 2,
        height_in_rows: 2,
        intra: false,
        disable_deblocking_filter_idc: 0,
      },
    ]
  }

  #[test]
  fn picture_edges_flagged_at_corners() {
    let mut store = MbParamStore::new(4, 4);
    store.build(SearchGeometry::new(Codec::H264), &two_slices(), false);
    let bank = store.bank(false);
    let top_left = bank[0];
    assert_ne!(top_left.flags & MB_EDGE_LEFT, 0);
    assert_ne!(top_left.flags & MB_EDGE_TOP, 0);
    assert_eq!(top_left.flags & MB_EDGE_RIGHT, 0);
    let bottom_right = bank[15];
    assert_ne!(bottom_right.flags & MB_EDGE_RIGHT, 0);
    assert_ne!(bottom_right.flags & MB_EDGE_BOTTOM, 0);
  }

  #[test]
  fn slice_boundaries_flagged_per_row() {
    let mut store = MbParamStore::new(4, 4);
    store.build(SearchGeometry::new(Codec::H264), &two_slices(), false);
    let bank = store.bank(false);
    // Rows 0 and 2 start a slice; rows 1 and 3 end one.
    assert_ne!(bank[0].flags & MB_SLICE_TOP, 0);
    assert_ne!(bank[4].flags & MB_SLICE_BOTTOM, 0);
    assert_ne!(bank[8].flags & MB_SLICE_TOP, 0);
    assert_eq!(bank[8].flags & MB_SLICE_BOTTOM, 0);
    assert_ne!(bank[12].flags & MB_SLICE_BOTTOM, 0);
  }

  #[test]
  fn search_window_clamped_at_borders() {
    let mut store = MbParamStore::new(8, 8);
    store.build(SearchGeometry::new(Codec::H264), &[], false);
    let bank = store.bank(false);
    // Top-left MB cannot search left or up at all.
    assert_eq!(bank[0].search_min_x, 0);
    assert_eq!(bank[0].search_min_y, 0);
    assert_eq!(bank[0].search_max_x, 48);
    assert_eq!(bank[0].search_max_y, 24);
    // An interior MB two columns in is limited by its own offset.
    let mb = bank[2];
    assert_eq!(mb.search_min_x, -32);
    // Bottom-right MB cannot search right or down.
    let last = bank[63];
    assert_eq!(last.search_max_x, 0);
    assert_eq!(last.search_max_y, 0);
    assert_eq!(last.search_min_x, -48);
  }

  #[test]
  fn banks_are_independent() {
    let mut store = MbParamStore::new(2, 2);
    store.build(SearchGeometry::new(Codec::Mpeg4), &[], true);
    assert_ne!(store.bank(true)[0].flags & MB_INTRA, 0);
    assert_eq!(store.bank(false)[0], MbInParams::default());
  }

  #[test]
  fn packed_words_round_trip_signed_bytes() {
    let mb = MbInParams {
      flags: MB_EDGE_LEFT | MB_SLICE_TOP,
      search_min_x: -48,
      search_max_x: 48,
      search_min_y: -24,
      search_max_y: 24,
    };
    let [w0, w1] = mb.pack();
    assert_eq!(w0, MB_EDGE_LEFT | MB_SLICE_TOP);
    assert_eq!(w1 & 0xff, (-48i8) as u8 as u32);
    assert_eq!((w1 >> 8) & 0xff, 48);
    assert_eq!((w1 >> 16) & 0xff, (-24i8) as u8 as u32);
    assert_eq!((w1 >> 24) & 0xff, 24);
  }
}
