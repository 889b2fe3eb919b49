// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use crate::api::internal::SessionInner;
use crate::api::EncodeSession;
use crate::command::{MAX_CORES, MAX_SLICES_PER_PICTURE};
use crate::header::H264Profile;
use crate::hwmem::BufferService;
use crate::util::Fixed;

use num_derive::FromPrimitive;
use thiserror::Error;

/// Codecs the hardware can target, by wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum Codec {
  H264 = 0,
  H263 = 1,
  Mpeg4 = 2,
  Jpeg = 3,
}

/// Largest coded dimension the search hardware addresses.
pub const MAX_CODED_DIMENSION: u32 = 4096;

/// Session-level encoder settings, fixed at session creation. Per-picture
/// knobs arrive through the parameter buffers instead.
#[derive(Clone, Copy, Debug)]
pub struct EncoderConfig {
  pub codec: Codec,
  /// Picture dimensions in pixels; sizes not multiples of 16 are coded
  /// MB-aligned and cropped in the sequence header.
  pub width: u32,
  pub height: u32,
  /// Encode cores to spread slices over.
  pub core_count: usize,
  /// Upper bound on slices per picture; sizes the header memory arena.
  pub max_slices: usize,
  /// H.264 only.
  pub h264_profile: H264Profile,
  pub level_idc: u8,
  /// MPEG-4 `profile_and_level_indication`.
  pub profile_and_level: u8,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    EncoderConfig {
      codec: Codec::H264,
      width: 1280,
      height: 720,
      core_count: MAX_CORES,
      max_slices: 4,
      h264_profile: H264Profile::Baseline,
      level_idc: 31,
      // Simple profile, level 3.
      profile_and_level: 0x03,
    }
  }
}

impl EncoderConfig {
  pub fn width_mbs(&self) -> u32 {
    (self.width as usize).align_power_of_two_and_shift(4) as u32
  }

  pub fn height_mbs(&self) -> u32 {
    (self.height as usize).align_power_of_two_and_shift(4) as u32
  }
}

/// Shorthand for `Config::new().with_encoder_config(enc)`.
impl From<EncoderConfig> for Config {
  fn from(enc: EncoderConfig) -> Self {
    Config { enc }
  }
}

/// Rejected encoder settings, reported before any hardware resource is
/// touched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected > 0, <= {MAX_CODED_DIMENSION})")]
  InvalidWidth(u32),
  /// The height is invalid.
  #[error("invalid height {0} (expected > 0, <= {MAX_CODED_DIMENSION})")]
  InvalidHeight(u32),
  /// The core count is invalid.
  #[error("invalid core count {0} (expected >= 1, <= {MAX_CORES})")]
  InvalidCoreCount(usize),
  /// The slice limit is invalid.
  #[error(
    "invalid slice limit {0} (expected >= 1, <= {MAX_SLICES_PER_PICTURE})"
  )]
  InvalidSliceLimit(usize),
  /// The codec has no encode pipeline on this hardware.
  #[error("codec {0:?} is not supported")]
  UnsupportedCodec(Codec),
  /// Buffer-object allocation failed while setting the session up.
  #[error("session allocation failed: {0}")]
  SessionAllocation(#[from] crate::api::EncoderStatus),
}

/// The set of options for an encode session.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
  enc: EncoderConfig,
}

impl Config {
  pub fn new() -> Self {
    Config::default()
  }

  pub fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Checks the configuration against the hardware limits.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;
    if config.width == 0 || config.width > MAX_CODED_DIMENSION {
      return Err(InvalidWidth(config.width));
    }
    if config.height == 0 || config.height > MAX_CODED_DIMENSION {
      return Err(InvalidHeight(config.height));
    }
    if config.core_count == 0 || config.core_count > MAX_CORES {
      return Err(InvalidCoreCount(config.core_count));
    }
    if config.max_slices == 0 || config.max_slices > MAX_SLICES_PER_PICTURE
    {
      return Err(InvalidSliceLimit(config.max_slices));
    }
    // The JPEG pipeline is stills-only and does not go through this
    // control path.
    if config.codec == Codec::Jpeg {
      return Err(UnsupportedCodec(config.codec));
    }
    Ok(())
  }

  /// Creates an [`EncodeSession`] backed by the given buffer service.
  pub fn new_session<S: BufferService>(
    &self, service: S,
  ) -> Result<EncodeSession<S>, InvalidConfig> {
    self.validate()?;
    log::info!(
      "new {:?} session: {}x{}, {} cores, <= {} slices",
      self.enc.codec,
      self.enc.width,
      self.enc.height,
      self.enc.core_count,
      self.enc.max_slices
    );
    let inner = SessionInner::new(self.enc, service)?;
    Ok(EncodeSession { inner })
  }
}
