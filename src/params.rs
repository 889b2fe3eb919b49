// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Typed views over the opaque parameter-buffer blobs.
//!
//! The media-API runtime delivers sequence/picture/slice/quantisation
//! parameters as little-endian byte blobs with a fixed per-codec layout.
//! Everything here validates before the session queues any command: a
//! malformed blob aborts the picture with `InvalidInput` and no partial
//! state.

use crate::api::{Codec, EncoderStatus};
use crate::hwmem::BufferHandle;
use crate::rate::RateControlParams;
use crate::util::clamp;

use nom::bytes::complete::take;
use nom::multi::count;
use nom::number::complete::le_u32;
use nom::IResult;
use num_derive::FromPrimitive;

/// Wire ids of the parameter-buffer kinds accepted by `render`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum BufferKind {
  Sequence = 1,
  Picture = 2,
  Slice = 3,
  QMatrix = 4,
}

/// Sequence-level parameters; one blob per sequence, layout fixed per
/// codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceParams {
  pub bits_per_second: u32,
  pub frame_rate: u32,
  pub buffer_size: u32,
  pub initial_qp: u32,
  pub min_qp: u32,
  pub basic_unit_size: u32,
  pub intra_period: u32,
  /// H.264 `level_idc`, MPEG-4 `profile_and_level_indication`; absent (0)
  /// for H.263.
  pub profile_level: u32,
  /// MPEG-4 only.
  pub vop_time_increment_resolution: u32,
}

impl SequenceParams {
  pub fn rate_params(&self) -> RateControlParams {
    RateControlParams {
      bits_per_second: self.bits_per_second,
      frame_rate: self.frame_rate,
      buffer_size: self.buffer_size,
      initial_qp: clamp(self.initial_qp, 0, 51) as u8,
      min_qp: clamp(self.min_qp, 0, 51) as u8,
      basic_unit_size: self.basic_unit_size,
    }
  }
}

/// Per-picture parameters: the surface and coded-buffer handles plus
/// picture-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureParams {
  pub reference_picture: Option<BufferHandle>,
  pub reconstructed_picture: Option<BufferHandle>,
  pub coded_buffer: Option<BufferHandle>,
  pub intra: bool,
}

const PICTURE_FLAG_INTRA: u32 = 1 << 0;

/// Per-slice parameters; the slice buffer carries one record per slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceParams {
  pub start_row: u32,
  pub height_in_rows: u32,
  pub intra: bool,
  /// 0 = on, 1 = off, 2 = on except slice edges.
  pub disable_deblocking_filter_idc: u32,
}

const SLICE_RECORD_SIZE: usize = 12;
const SLICE_FLAG_INTRA: u32 = 1 << 0;

/// MPEG-4 custom quantisation matrices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QMatrixParams {
  pub intra: [u8; 64],
  pub inter: [u8; 64],
}

type NomResult<'a, T> = IResult<&'a [u8], T>;

fn handle(v: u32) -> Option<BufferHandle> {
  if v == 0 {
    None
  } else {
    Some(BufferHandle(v))
  }
}

fn seq_common(input: &[u8]) -> NomResult<SequenceParams> {
  let (input, bits_per_second) = le_u32(input)?;
  let (input, frame_rate) = le_u32(input)?;
  let (input, buffer_size) = le_u32(input)?;
  let (input, initial_qp) = le_u32(input)?;
  let (input, min_qp) = le_u32(input)?;
  let (input, basic_unit_size) = le_u32(input)?;
  let (input, intra_period) = le_u32(input)?;
  Ok((
    input,
    SequenceParams {
      bits_per_second,
      frame_rate,
      buffer_size,
      initial_qp,
      min_qp,
      basic_unit_size,
      intra_period,
      profile_level: 0,
      vop_time_increment_resolution: 0,
    },
  ))
}

fn seq_h264(input: &[u8]) -> NomResult<SequenceParams> {
  let (input, mut params) = seq_common(input)?;
  let (input, level_idc) = le_u32(input)?;
  params.profile_level = level_idc;
  Ok((input, params))
}

fn seq_mpeg4(input: &[u8]) -> NomResult<SequenceParams> {
  let (input, mut params) = seq_common(input)?;
  let (input, profile_and_level) = le_u32(input)?;
  let (input, time_resolution) = le_u32(input)?;
  params.profile_level = profile_and_level;
  params.vop_time_increment_resolution = time_resolution;
  Ok((input, params))
}

fn picture(input: &[u8]) -> NomResult<PictureParams> {
  let (input, reference) = le_u32(input)?;
  let (input, reconstructed) = le_u32(input)?;
  let (input, coded) = le_u32(input)?;
  let (input, flags) = le_u32(input)?;
  Ok((
    input,
    PictureParams {
      reference_picture: handle(reference),
      reconstructed_picture: handle(reconstructed),
      coded_buffer: handle(coded),
      intra: flags & PICTURE_FLAG_INTRA != 0,
    },
  ))
}

fn slice(input: &[u8]) -> NomResult<SliceParams> {
  let (input, start_row) = le_u32(input)?;
  let (input, height_in_rows) = le_u32(input)?;
  let (input, flags) = le_u32(input)?;
  Ok((
    input,
    SliceParams {
      start_row,
      height_in_rows,
      intra: flags & SLICE_FLAG_INTRA != 0,
      disable_deblocking_filter_idc: (flags >> 1) & 0x3,
    },
  ))
}

fn qmatrix(input: &[u8]) -> NomResult<QMatrixParams> {
  let (input, intra) = take(64usize)(input)?;
  let (input, inter) = take(64usize)(input)?;
  let mut params = QMatrixParams { intra: [0; 64], inter: [0; 64] };
  params.intra.copy_from_slice(intra);
  params.inter.copy_from_slice(inter);
  Ok((input, params))
}

fn finish<T>(result: NomResult<T>) -> Result<T, EncoderStatus> {
  match result {
    Ok((rest, value)) if rest.is_empty() => Ok(value),
    _ => Err(EncoderStatus::InvalidInput),
  }
}

pub fn parse_sequence(
  codec: Codec, blob: &[u8],
) -> Result<SequenceParams, EncoderStatus> {
  match codec {
    Codec::H264 => finish(seq_h264(blob)),
    Codec::Mpeg4 => finish(seq_mpeg4(blob)),
    Codec::H263 => finish(seq_common(blob)),
    Codec::Jpeg => Err(EncoderStatus::Unsupported),
  }
}

pub fn parse_picture(blob: &[u8]) -> Result<PictureParams, EncoderStatus> {
  finish(picture(blob))
}

pub fn parse_slices(blob: &[u8]) -> Result<Vec<SliceParams>, EncoderStatus> {
  if blob.is_empty() || blob.len() % SLICE_RECORD_SIZE != 0 {
    return Err(EncoderStatus::InvalidInput);
  }
  finish(count(slice, blob.len() / SLICE_RECORD_SIZE)(blob))
}

pub fn parse_qmatrix(blob: &[u8]) -> Result<QMatrixParams, EncoderStatus> {
  finish(qmatrix(blob))
}
