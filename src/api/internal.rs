// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use crate::api::config::{Codec, EncoderConfig};
use crate::api::EncoderStatus;
use crate::bias::{build_bias_tables, SkipScale};
use crate::command::{CommandAssembler, MAX_SLICES_PER_PICTURE};
use crate::header::{
  H263HeaderWriter, H263PictureType, H264HeaderWriter, H264HrdParams,
  H264PpsParams, H264SliceHeaderParams, H264SliceType, H264SpsParams,
  HeaderElementStream, Mpeg4HeaderWriter, Mpeg4VbvParams, Mpeg4VolParams,
  Mpeg4VopType,
};
use crate::hwmem::{
  BufferHandle, BufferService, CmdBufPool, CompletionFence, HeaderMem,
  HeaderMemLayout, HeaderRegion, Placement,
};
use crate::mbparams::{MbParamStore, SearchGeometry};
use crate::params::{
  self, BufferKind, PictureParams, QMatrixParams, SequenceParams,
  SliceParams,
};
use crate::rate::{RCState, RateControlParams, RcPicParams};
use crate::util::clamp;

use log::{debug, info};

/// Command-buffer bytes per generation; one picture's stream over all
/// cores stays well under this.
const CMD_BUF_SIZE: usize = 16 << 10;

/// Largest bias-table block: 52 QPs, four tables, 8 bytes per write.
const BIAS_MEM_SIZE: usize = 52 * 4 * 8;

/// Bytes per macroblock in-params record.
const MB_RECORD_SIZE: usize = 8;

/// Budget-drain estimates kept around for coded-size reports; hardware
/// reports trail by at most a couple of generations.
const MAX_PENDING_CODED_REPORTS: usize = 32;

/// Handles a finished picture leaves behind for skip-frame pipelining.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PictureHandles {
  pub reconstructed: BufferHandle,
  pub coded: BufferHandle,
}

fn budget_word(v: i64) -> u32 {
  clamp(v, 0, u32::MAX as i64) as u32
}

/// Serializes the rate-control in-params into the block the firmware
/// fetches at start-picture.
fn rc_param_bytes(pic: &RcPicParams) -> Vec<u8> {
  let words = [
    u32::from(pic.qp) | (u32::from(pic.min_qp) << 8)
      | (u32::from(pic.max_qp) << 16),
    pic.basic_unit_size,
    budget_word(pic.bits_per_frame),
    budget_word(pic.bits_per_bu),
    budget_word(pic.bits_per_mb),
    budget_word(pic.buffer_size),
    budget_word(pic.initial_level),
    budget_word(pic.initial_delay),
    pic.th_skip as u32,
  ];
  words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// The state machine behind [`EncodeSession`](crate::api::EncodeSession):
/// begin-picture / render / end-picture, driven by a single thread.
///
/// [`EncodeSession`]: crate::api::EncodeSession
pub(crate) struct SessionInner<S: BufferService> {
  config: EncoderConfig,
  service: S,
  rc: RCState,
  assembler: CommandAssembler,
  cmd_pool: CmdBufPool,
  header_mem: HeaderMem,
  header_buffer: BufferHandle,
  bias_buffer: BufferHandle,
  pic_param_buffer: BufferHandle,
  mb_param_buffer: BufferHandle,
  mb_params: MbParamStore,
  geometry: SearchGeometry,
  skip_scale: SkipScale,
  frame_index: u64,
  idr_count: u32,
  in_picture: bool,
  codec_announced: bool,
  sequence: Option<SequenceParams>,
  picture: Option<PictureParams>,
  slices: Vec<SliceParams>,
  qmatrix: Option<QMatrixParams>,
  prev_handles: [Option<PictureHandles>; 3],
  last_cmd_buffer: Option<BufferHandle>,
  /// Per-frame budget drains applied at `end_picture`, awaiting the
  /// hardware's coded-size reports.
  drain_estimates: Vec<(u64, i64)>,
}

impl<S: BufferService> SessionInner<S> {
  pub fn new(
    config: EncoderConfig, mut service: S,
  ) -> Result<Self, EncoderStatus> {
    let layout = HeaderMemLayout::new(config.max_slices);
    let header_buffer =
      service.create(layout.total_size(), Placement::Shared)?;
    let bias_buffer = service.create(BIAS_MEM_SIZE, Placement::Shared)?;
    let pic_param_buffer = service.create(64, Placement::Shared)?;
    let mbs = (config.width_mbs() * config.height_mbs()) as usize;
    let mb_param_buffer =
      service.create(mbs * MB_RECORD_SIZE * 2, Placement::Shared)?;
    let cmd_pool = CmdBufPool::new(&mut service, CMD_BUF_SIZE)?;

    // Rate control starts from the defaults; the sequence parameter
    // buffer replaces them before the first picture in practice.
    let rc = RCState::new(
      config.codec,
      config.width,
      config.height,
      config.max_slices as u32,
      config.core_count as u32,
      &RateControlParams::default(),
    );

    Ok(SessionInner {
      rc,
      assembler: CommandAssembler::new(config.core_count),
      cmd_pool,
      header_mem: HeaderMem::new(layout),
      header_buffer,
      bias_buffer,
      pic_param_buffer,
      mb_param_buffer,
      mb_params: MbParamStore::new(config.width_mbs(), config.height_mbs()),
      geometry: SearchGeometry::new(config.codec),
      skip_scale: SkipScale::X12,
      frame_index: 0,
      idr_count: 0,
      in_picture: false,
      codec_announced: false,
      sequence: None,
      picture: None,
      slices: Vec::new(),
      qmatrix: None,
      prev_handles: [None; 3],
      last_cmd_buffer: None,
      drain_estimates: Vec::new(),
      config,
      service,
    })
  }

  pub fn frame_index(&self) -> u64 {
    self.frame_index
  }

  pub fn active_core_count(&self) -> usize {
    self.assembler.active_core_count()
  }

  pub fn rc(&self) -> &RCState {
    &self.rc
  }

  pub fn service(&self) -> &S {
    &self.service
  }

  pub fn previous_handles(&self) -> &[Option<PictureHandles>; 3] {
    &self.prev_handles
  }

  pub fn qmatrix(&self) -> Option<&QMatrixParams> {
    self.qmatrix.as_ref()
  }

  /// Claims a command buffer and opens the picture: start-picture on
  /// every core, master core released last.
  pub fn begin_picture(&mut self) -> Result<(), EncoderStatus> {
    assert!(!self.in_picture, "begin_picture while a picture is open");
    let cmd_buf = self.cmd_pool.acquire();
    self.last_cmd_buffer = Some(cmd_buf);
    self.picture = None;
    self.slices.clear();
    self.in_picture = true;
    if !self.codec_announced {
      self.assembler.queue_new_codec(self.config.codec as u32);
      self.codec_announced = true;
    }
    self.assembler.begin_picture(self.pic_param_buffer, 0);
    debug!("picture {} opened", self.frame_index);
    Ok(())
  }

  /// Accepts one parameter buffer. A malformed blob or missing handle
  /// aborts the picture before any slice command is queued.
  pub fn render(
    &mut self, kind: BufferKind, blob: &[u8],
  ) -> Result<(), EncoderStatus> {
    assert!(self.in_picture, "render with no picture open");
    let result = self.render_inner(kind, blob);
    if result.is_err() {
      self.abort_picture();
    }
    result
  }

  fn render_inner(
    &mut self, kind: BufferKind, blob: &[u8],
  ) -> Result<(), EncoderStatus> {
    match kind {
      BufferKind::Sequence => {
        let seq = params::parse_sequence(self.config.codec, blob)?;
        if self.sequence.is_some() {
          // Mid-stream sequence updates only move the bitrate; the
          // other fields are fixed per session.
          self.rc.update_bitrate(seq.bits_per_second);
          if self.rc.bitrate_changed() {
            info!("bitrate change to {} bps", self.rc.target_bitrate());
          }
        } else {
          self.rc = RCState::new(
            self.config.codec,
            self.config.width,
            self.config.height,
            self.config.max_slices as u32,
            self.config.core_count as u32,
            &seq.rate_params(),
          );
        }
        self.sequence = Some(seq);
        Ok(())
      }
      BufferKind::Picture => {
        let picture = params::parse_picture(blob)?;
        let missing = picture.reconstructed_picture.is_none()
          || picture.coded_buffer.is_none()
          || (!picture.intra && picture.reference_picture.is_none());
        if missing {
          return Err(EncoderStatus::MissingHandle);
        }
        self.picture = Some(picture);
        Ok(())
      }
      BufferKind::Slice => {
        let slices = params::parse_slices(blob)?;
        assert!(
          slices.len() <= MAX_SLICES_PER_PICTURE,
          "slice count exceeds hardware limit"
        );
        // The header arena only has regions for the configured limit.
        if slices.len() > self.config.max_slices {
          return Err(EncoderStatus::InvalidInput);
        }
        self.slices = slices;
        Ok(())
      }
      BufferKind::QMatrix => {
        self.qmatrix = Some(params::parse_qmatrix(blob)?);
        Ok(())
      }
    }
  }

  /// Finalizes the picture: bias tables, headers, slice scheduling,
  /// rate-control bookkeeping, and the command-stream flush.
  pub fn end_picture(&mut self) -> Result<(), EncoderStatus> {
    assert!(self.in_picture, "end_picture with no picture open");
    let result = self.end_picture_inner();
    if result.is_err() {
      self.abort_picture();
    }
    result
  }

  fn end_picture_inner(&mut self) -> Result<(), EncoderStatus> {
    let picture = self.picture.ok_or(EncoderStatus::MissingHandle)?;
    let intra = picture.intra || self.frame_index == 0;
    if self.slices.is_empty() {
      // No slice buffer rendered: the picture is one full-height slice.
      self.slices.push(SliceParams {
        start_row: 0,
        height_in_rows: self.config.height_mbs(),
        intra,
        disable_deblocking_filter_idc: 0,
      });
    }
    self.assembler.set_slice_count(self.slices.len());

    // Bias tables go to every active core ahead of its first slice.
    let writes = build_bias_tables(self.config.codec, self.skip_scale);
    let mut bias_bytes = Vec::with_capacity(writes.len() * 8);
    for write in &writes {
      bias_bytes.extend_from_slice(&write.offset.to_le_bytes());
      bias_bytes.extend_from_slice(&write.value.to_le_bytes());
    }
    self.service.upload(self.bias_buffer, 0, &bias_bytes)?;
    self.assembler.queue_bias_tables(self.bias_buffer, 0);

    self.build_headers(intra)?;

    // Neighbor in-params for this picture's slice layout; the other
    // bank keeps the previous picture type's layout.
    self.mb_params.build(self.geometry, &self.slices, intra);
    let bank_offset = if intra {
      0
    } else {
      self.mb_params.bank(true).len() * MB_RECORD_SIZE
    };
    self.service.upload(
      self.mb_param_buffer,
      bank_offset,
      &self.mb_params.bank_bytes(intra),
    )?;

    let pic = self.rc.pic_params(self.frame_index);
    self.service.upload(self.pic_param_buffer, 0, &rc_param_bytes(&pic))?;

    self.assembler.end_picture();
    let cmd_buf = self.last_cmd_buffer.ok_or(EncoderStatus::MissingHandle)?;
    let stream = self.assembler.flush();
    if stream.len() > CMD_BUF_SIZE {
      return Err(EncoderStatus::CommandBufferOverflow);
    }
    self.service.upload(self.header_buffer, 0, self.header_mem.bytes())?;
    self.service.upload(cmd_buf, 0, &stream)?;
    debug!(
      "picture {} flushed: {} command bytes, {} slices over {} cores",
      self.frame_index,
      stream.len(),
      self.slices.len(),
      self.assembler.active_core_count()
    );

    // The hardware reports coded sizes asynchronously; until a report
    // lands the model drains at the per-frame budget, and the estimate
    // is kept so the report can correct it.
    let drained =
      self.rc.update_bits_transmitted(self.frame_index, pic.bits_per_frame);
    if drained > 0 {
      self.drain_estimates.push((self.frame_index, drained));
      if self.drain_estimates.len() > MAX_PENDING_CODED_REPORTS {
        self.drain_estimates.remove(0);
      }
    }
    self.prev_handles = [
      Some(PictureHandles {
        reconstructed: picture
          .reconstructed_picture
          .ok_or(EncoderStatus::MissingHandle)?,
        coded: picture.coded_buffer.ok_or(EncoderStatus::MissingHandle)?,
      }),
      self.prev_handles[0],
      self.prev_handles[1],
    ];
    if intra {
      self.idr_count = self.idr_count.wrapping_add(1);
    }
    self.frame_index += 1;
    self.in_picture = false;
    Ok(())
  }

  /// Records the completion handle of the hardware job consuming the
  /// last flushed command buffer.
  pub fn attach_completion(&mut self, fence: Box<dyn CompletionFence>) {
    if let Some(buffer) = self.last_cmd_buffer {
      self.cmd_pool.attach_fence(buffer, fence);
    }
  }

  /// Feeds back the true coded size of a retired picture, replacing the
  /// budget-based drain `end_picture` applied for that frame. Duplicate
  /// reports and reports for pre-transmission frames are ignored.
  pub fn report_coded_size(&mut self, frame_index: u64, coded_bits: i64) {
    if let Some(pos) = self
      .drain_estimates
      .iter()
      .position(|&(frame, _)| frame == frame_index)
    {
      let (_, estimate) = self.drain_estimates.remove(pos);
      self.rc.correct_bits_transmitted(coded_bits, estimate);
    }
  }

  /// Emits the end-of-sequence and end-of-stream headers. H.264 only;
  /// the other codecs end at the last VOP/picture.
  pub fn finish(&mut self) -> Result<(), EncoderStatus> {
    assert!(!self.in_picture, "finish with a picture open");
    if self.config.codec == Codec::H264 {
      let mut stream = HeaderElementStream::new();
      stream.write_h264_end_of_sequence()?;
      self
        .header_mem
        .write(HeaderRegion::EndOfSequence, &stream.serialize())?;
      let mut stream = HeaderElementStream::new();
      stream.write_h264_end_of_stream()?;
      self
        .header_mem
        .write(HeaderRegion::EndOfStream, &stream.serialize())?;
      self.service.upload(self.header_buffer, 0, self.header_mem.bytes())?;
    }
    Ok(())
  }

  /// Waits out in-flight work, returns every owned buffer object, and
  /// hands the service back to the caller.
  pub fn close(mut self) -> S {
    self.cmd_pool.destroy(&mut self.service);
    self.service.destroy(self.header_buffer);
    self.service.destroy(self.bias_buffer);
    self.service.destroy(self.pic_param_buffer);
    self.service.destroy(self.mb_param_buffer);
    self.service
  }

  fn abort_picture(&mut self) {
    debug!("picture {} aborted", self.frame_index);
    self.assembler.invalidate();
    // The next picture recomputes rate control as picture 0 does.
    self.rc.invalidate_cache();
    self.picture = None;
    self.slices.clear();
    self.in_picture = false;
  }

  fn emit_header(
    &mut self, region: HeaderRegion, stream: &HeaderElementStream,
  ) -> Result<(), EncoderStatus> {
    let offset = self.header_mem.write(region, &stream.serialize())?;
    self.assembler.queue_header(self.header_buffer, offset);
    Ok(())
  }

  fn build_headers(&mut self, intra: bool) -> Result<(), EncoderStatus> {
    match self.config.codec {
      Codec::H264 => self.build_h264_headers(intra),
      Codec::Mpeg4 => self.build_mpeg4_headers(intra),
      Codec::H263 => self.build_h263_headers(intra),
      Codec::Jpeg => Err(EncoderStatus::Unsupported),
    }
  }

  fn build_h264_headers(&mut self, intra: bool) -> Result<(), EncoderStatus> {
    let hrd = self.rc.hrd().map(|_| H264HrdParams {
      bit_rate: self.rc.target_bitrate(),
      cpb_size: budget_word(self.rc.buffer_size()),
      initial_cpb_removal_delay: self.rc.initial_cpb_removal_delay(),
    });

    let mut stream = HeaderElementStream::new();
    stream.write_h264_aud(u32::from(!intra))?;
    self.emit_header(HeaderRegion::Aud, &stream)?;

    if intra {
      let config = self.config;
      let mut stream = HeaderElementStream::new();
      stream.write_h264_sps(&H264SpsParams {
        profile: config.h264_profile,
        level_idc: config.level_idc,
        width_mbs: config.width_mbs(),
        height_mbs: config.height_mbs(),
        crop_right: config.width_mbs() * 16 - config.width,
        crop_bottom: config.height_mbs() * 16 - config.height,
        log2_max_frame_num_minus4: 12,
        log2_max_pic_order_cnt_lsb_minus4: 12,
        max_num_ref_frames: 1,
        frame_rate: self.rc.frame_rate(),
        hrd,
      })?;
      self.emit_header(HeaderRegion::Sequence, &stream)?;

      let mut stream = HeaderElementStream::new();
      stream.write_h264_pps(&H264PpsParams {
        profile: config.h264_profile,
        pic_init_qp: self.rc.initial_qp(),
        deblock_control_present: true,
      })?;
      self.emit_header(HeaderRegion::Picture, &stream)?;

      if let Some(hrd) = hrd {
        let mut stream = HeaderElementStream::new();
        stream.write_h264_sei_buffering_period(&hrd)?;
        self.emit_header(HeaderRegion::SeiBufferingPeriod, &stream)?;
      }
    }
    if hrd.is_some() {
      let mut stream = HeaderElementStream::new();
      // Two clock ticks per frame with the fixed-rate VUI timing.
      stream.write_h264_sei_picture_timing(self.frame_index as u32 * 2, 0)?;
      self.emit_header(HeaderRegion::SeiPictureTiming, &stream)?;
    }

    let slices = self.slices.clone();
    let cabac = self.config.h264_profile.cabac();
    let width_mbs = self.config.width_mbs();
    for (i, slice) in slices.iter().enumerate() {
      let mut stream = HeaderElementStream::new();
      stream.write_h264_slice_header(&H264SliceHeaderParams {
        slice_type: if intra {
          H264SliceType::Idr
        } else {
          H264SliceType::P
        },
        idr_pic_id: self.idr_count,
        disable_deblocking_filter_idc: slice.disable_deblocking_filter_idc,
        deblock_control_present: true,
        cabac,
      })?;
      let offset =
        self.header_mem.write(HeaderRegion::Slice(i), &stream.serialize())?;
      self.assembler.queue_slice(
        self.header_buffer,
        offset,
        slice,
        width_mbs,
      );
    }
    Ok(())
  }

  fn build_mpeg4_headers(&mut self, intra: bool) -> Result<(), EncoderStatus> {
    if intra {
      let time_resolution = self
        .sequence
        .map(|s| s.vop_time_increment_resolution)
        .filter(|&r| r != 0)
        .unwrap_or_else(|| self.rc.frame_rate());
      let mut stream = HeaderElementStream::new();
      stream.write_mpeg4_sequence_header(&Mpeg4VolParams {
        profile_and_level: self.config.profile_and_level,
        width: self.config.width,
        height: self.config.height,
        vop_time_increment_resolution: time_resolution,
        vbv: Some(Mpeg4VbvParams {
          bit_rate: self.rc.target_bitrate() / 400,
          buffer_size: budget_word(self.rc.buffer_size() / 16384),
          occupancy: budget_word(self.rc.buffer_size() / 2 / 64),
        }),
      })?;
      self.emit_header(HeaderRegion::Sequence, &stream)?;
    }

    let mut stream = HeaderElementStream::new();
    let vop_type = if intra { Mpeg4VopType::I } else { Mpeg4VopType::P };
    stream.write_mpeg4_vop_header(vop_type, 2)?;
    self.emit_header(HeaderRegion::Picture, &stream)?;

    self.queue_headerless_slices()
  }

  fn build_h263_headers(&mut self, intra: bool) -> Result<(), EncoderStatus> {
    let mut stream = HeaderElementStream::new();
    let picture_type =
      if intra { H263PictureType::I } else { H263PictureType::P };
    stream.write_h263_picture_header(
      picture_type,
      self.config.width,
      self.config.height,
    )?;
    self.emit_header(HeaderRegion::Picture, &stream)?;

    self.queue_headerless_slices()
  }

  /// MPEG-4 and H.263 slices carry no host-built header (resync markers
  /// are disabled); the do-header region is an empty stream.
  fn queue_headerless_slices(&mut self) -> Result<(), EncoderStatus> {
    let slices = self.slices.clone();
    let width_mbs = self.config.width_mbs();
    let empty = HeaderElementStream::new();
    for (i, slice) in slices.iter().enumerate() {
      let offset =
        self.header_mem.write(HeaderRegion::Slice(i), &empty.serialize())?;
      self.assembler.queue_slice(
        self.header_buffer,
        offset,
        slice,
        width_mbs,
      );
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::Config;
  use crate::hwmem::testutil::{CountingFence, FakeBufferService};
  use crate::rate::TransmitPhase;
  use num_traits::FromPrimitive;
  use std::cell::RefCell;
  use std::rc::Rc;

  fn le_blob(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
  }

  fn h264_session(
    core_count: usize,
  ) -> SessionInner<FakeBufferService> {
    let config = EncoderConfig { core_count, ..Default::default() };
    Config::new()
      .with_encoder_config(config)
      .new_session(FakeBufferService::default())
      .unwrap()
      .into_inner()
  }

  fn sequence_blob() -> Vec<u8> {
    // bitrate, fps, buffer, qp, min qp, bu, intra period, level.
    le_blob(&[2_000_000, 30, 4_000_000, 0, 10, 0, 30, 31])
  }

  fn picture_blob(reference: u32, intra: bool) -> Vec<u8> {
    le_blob(&[reference, 100, 101, intra as u32])
  }

  fn four_slice_blob() -> Vec<u8> {
    le_blob(&[0, 11, 0, 11, 11, 0, 22, 11, 0, 33, 12, 0])
  }

  fn encode_one(
    session: &mut SessionInner<FakeBufferService>, reference: u32,
    intra: bool,
  ) {
    session.begin_picture().unwrap();
    session.render(BufferKind::Sequence, &sequence_blob()).unwrap();
    session
      .render(BufferKind::Picture, &picture_blob(reference, intra))
      .unwrap();
    session.render(BufferKind::Slice, &four_slice_blob()).unwrap();
    session.end_picture().unwrap();
  }

  #[test]
  fn full_picture_lifecycle() {
    let mut session = h264_session(2);
    encode_one(&mut session, 0, true);
    assert_eq!(session.frame_index(), 1);
    assert_eq!(session.active_core_count(), 2);
    assert_eq!(session.rc().target_bitrate(), 2_000_000);

    // The flushed stream starts with the codec announcement.
    let cmd_buf = session.last_cmd_buffer.unwrap();
    let bytes = &session.service().buffers[&cmd_buf];
    let first = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    assert_eq!(
      crate::command::CmdOpcode::from_u8((first & 0xff) as u8),
      Some(crate::command::CmdOpcode::NewCodec)
    );
  }

  #[test]
  fn inter_pictures_rotate_previous_handles() {
    let mut session = h264_session(2);
    encode_one(&mut session, 0, true);
    encode_one(&mut session, 100, false);
    encode_one(&mut session, 100, false);
    let handles = session.previous_handles();
    assert!(handles.iter().all(|h| h.is_some()));
    assert_eq!(handles[0].unwrap().coded, BufferHandle(101));
    assert_eq!(handles[0].unwrap().reconstructed, BufferHandle(100));
    assert_eq!(session.frame_index(), 3);
  }

  #[test]
  fn missing_coded_buffer_aborts_picture() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    let blob = le_blob(&[0, 100, 0, 1]); // no coded buffer
    assert_eq!(
      session.render(BufferKind::Picture, &blob),
      Err(EncoderStatus::MissingHandle)
    );
    // The abort closed the picture; a fresh one opens cleanly.
    session.begin_picture().unwrap();
  }

  #[test]
  fn malformed_blob_aborts_picture() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    assert_eq!(
      session.render(BufferKind::Sequence, &[1, 2, 3]),
      Err(EncoderStatus::InvalidInput)
    );
    session.begin_picture().unwrap();
  }

  #[test]
  fn slice_count_above_session_limit_rejected() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    // Five slices against a limit of four.
    let blob = le_blob(&[
      0, 9, 0, 9, 9, 0, 18, 9, 0, 27, 9, 0, 36, 9, 0,
    ]);
    assert_eq!(
      session.render(BufferKind::Slice, &blob),
      Err(EncoderStatus::InvalidInput)
    );
  }

  #[test]
  fn picture_without_slices_covers_full_height() {
    let mut session = h264_session(4);
    session.begin_picture().unwrap();
    session.render(BufferKind::Picture, &picture_blob(0, true)).unwrap();
    session.end_picture().unwrap();
    // One slice shrinks the active set to a single core.
    assert_eq!(session.active_core_count(), 1);
  }

  #[test]
  fn rate_control_model_advances_per_picture() {
    let mut session = h264_session(2);
    encode_one(&mut session, 0, true);
    // 2 Mbps with a 4 Mbit buffer: 66666 bits per frame reaches the
    // 2 Mbit initial level at frame 31.
    assert_eq!(session.rc().phase(), TransmitPhase::NotStarted);
    for _ in 0..31 {
      encode_one(&mut session, 100, false);
    }
    assert_eq!(session.rc().phase(), TransmitPhase::Transmitting);
  }

  #[test]
  fn coded_size_report_replaces_budget_estimate() {
    let mut session = h264_session(2);
    encode_one(&mut session, 0, true);
    for _ in 0..31 {
      encode_one(&mut session, 100, false);
    }
    assert_eq!(session.rc().phase(), TransmitPhase::Transmitting);
    let budget = session.rc().bits_per_frame();

    encode_one(&mut session, 100, false);
    let frame = session.frame_index() - 1;
    let before = session.rc().bits_consumed();
    // A report matching the budget estimate leaves the model unchanged;
    // the frame is not drained a second time.
    session.report_coded_size(frame, budget);
    assert_eq!(session.rc().bits_consumed(), before);
    // A second report for the same frame is dropped.
    session.report_coded_size(frame, budget * 2);
    assert_eq!(session.rc().bits_consumed(), before);

    encode_one(&mut session, 100, false);
    let frame = session.frame_index() - 1;
    session.report_coded_size(frame, budget * 2);
    assert_eq!(session.rc().bits_consumed(), before + 2 * budget);
  }

  #[test]
  fn sub_unit_bitrate_sequence_encodes() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    // 32 bps is valid input (only zero selects the fallback); the HRD
    // header fields floor at one rate unit instead of underflowing.
    let blob = le_blob(&[32, 30, 0, 28, 10, 0, 30, 31]);
    session.render(BufferKind::Sequence, &blob).unwrap();
    session.render(BufferKind::Picture, &picture_blob(0, true)).unwrap();
    session.end_picture().unwrap();
    assert_eq!(session.frame_index(), 1);
  }

  #[test]
  fn completion_fence_gates_buffer_reuse() {
    let mut session = h264_session(2);
    let waited = Rc::new(RefCell::new(0));
    encode_one(&mut session, 0, true);
    session
      .attach_completion(Box::new(CountingFence { waited: waited.clone() }));
    encode_one(&mut session, 100, false);
    assert_eq!(*waited.borrow(), 0);
    // The third picture reuses the first generation's buffer.
    encode_one(&mut session, 100, false);
    assert_eq!(*waited.borrow(), 1);
  }

  #[test]
  #[should_panic(expected = "render with no picture open")]
  fn render_outside_picture_panics() {
    let mut session = h264_session(2);
    let _ = session.render(BufferKind::Sequence, &sequence_blob());
  }

  #[test]
  #[should_panic(expected = "begin_picture while a picture is open")]
  fn nested_begin_picture_panics() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    session.begin_picture().unwrap();
  }

  #[test]
  fn mpeg4_session_encodes() {
    let config = EncoderConfig {
      codec: Codec::Mpeg4,
      width: 352,
      height: 288,
      core_count: 2,
      ..Default::default()
    };
    let mut session = Config::new()
      .with_encoder_config(config)
      .new_session(FakeBufferService::default())
      .unwrap()
      .into_inner();
    session.begin_picture().unwrap();
    let blob = le_blob(&[512_000, 25, 0, 12, 2, 0, 25, 0x03, 25]);
    session.render(BufferKind::Sequence, &blob).unwrap();
    session.render(BufferKind::Picture, &picture_blob(0, true)).unwrap();
    session.end_picture().unwrap();
    assert_eq!(session.frame_index(), 1);
    session.finish().unwrap();
  }

  #[test]
  fn qmatrix_buffer_accepted() {
    let mut session = h264_session(2);
    session.begin_picture().unwrap();
    let mut blob = vec![1u8; 64];
    blob.extend(vec![2u8; 64]);
    session.render(BufferKind::QMatrix, &blob).unwrap();
    assert_eq!(session.qmatrix().unwrap().inter[0], 2);
  }

  #[test]
  fn close_returns_all_buffers() {
    let session = h264_session(2);
    assert!(session.service().buffers.len() >= 6);
    let service = session.close();
    assert!(service.buffers.is_empty());
  }
}
