// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Header-element builder.
//!
//! Codec headers are assembled as a bounded sequence of *elements*: literal
//! bit runs, or tokens naming a value the firmware substitutes at encode
//! time (current QP, current macroblock address, frame number, ...). The
//! host never computes token values; it only reserves their position in the
//! stream. Byte alignment is itself a token, because the final bit position
//! is unknown until the firmware has resolved the preceding tokens.

use crate::api::EncoderStatus;
use crate::util::ILog;

use arrayvec::ArrayVec;
use num_derive::FromPrimitive;

/// Hard cap on elements per header; firmware headers never come close.
pub const MAX_HEADER_ELEMENTS: usize = 16;
/// Data bits one raw element can hold alongside its size field.
pub const RAW_ELEMENT_MAX_BITS: usize = 120;
const RAW_ELEMENT_CAPACITY: usize = RAW_ELEMENT_MAX_BITS / 8;

/// Values resolved by the firmware at encode time.
///
/// The discriminants are wire ABI shared with the firmware; changing them
/// breaks compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Token {
  /// Current quantiser, e.g. `slice_qp_delta` or `vop_quant`.
  Qp = 0x01,
  /// Address of the first macroblock in the current slice.
  CurrMbAddr = 0x02,
  /// Current frame number (`frame_num`, TR).
  FrameNum = 0x03,
  /// Picture order count LSBs.
  PicOrderCnt = 0x04,
  /// H.264 reference list 0 reordering syntax.
  ReorderL0 = 0x05,
  /// H.264 reference list 1 reordering syntax.
  ReorderL1 = 0x06,
  /// H.264 adaptive reference picture marking syntax.
  AdaptiveMarking = 0x07,
  /// Pad with `rbsp_trailing_bits()` (a one then zeros).
  ByteAlignH264 = 0x08,
  /// Pad with MPEG-4 `next_start_code()` stuffing (a zero then ones).
  ByteAlignMpeg4 = 0x09,
  /// MPEG-4 `modulo_time_base`/`vop_time_increment` pair with markers.
  TimeReference = 0x0a,
}

const RAW_ELEMENT_TAG: u8 = 0x00;

/// One atomic unit of header output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderElement {
  /// A literal bit run, MSB-first within each byte.
  RawBits {
    /// Number of valid bits.
    nbits: u32,
    /// Packed bits; the last byte is zero-padded on the right.
    bytes: ArrayVec<u8, RAW_ELEMENT_CAPACITY>,
  },
  /// A firmware-resolved placeholder.
  Token(Token),
}

/// An append-only element sequence for one codec header.
///
/// Raw writes merge into the current element until it is full; tokens always
/// start a new element. Exceeding [`MAX_HEADER_ELEMENTS`] is a programming
/// error and panics.
#[derive(Debug, Clone, Default)]
pub struct HeaderElementStream {
  elements: ArrayVec<HeaderElement, MAX_HEADER_ELEMENTS>,
}

impl HeaderElementStream {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn elements(&self) -> &[HeaderElement] {
    &self.elements
  }

  /// Total literal bits across all raw elements.
  pub fn raw_bit_len(&self) -> usize {
    self
      .elements
      .iter()
      .map(|e| match e {
        HeaderElement::RawBits { nbits, .. } => *nbits as usize,
        HeaderElement::Token(_) => 0,
      })
      .sum()
  }

  /// Appends `nbits` literal bits (the low bits of `value`, MSB first).
  ///
  /// Merges into the current raw element while it has spare capacity, so
  /// adjacent writes cost one element, not one element each.
  pub fn write_bits(&mut self, value: u32, nbits: u32) {
    assert!(nbits <= 32);
    debug_assert!(nbits == 32 || u64::from(value) < (1u64 << nbits));
    if nbits == 0 {
      return;
    }
    let needs_new = !matches!(
      self.elements.last(),
      Some(HeaderElement::RawBits { nbits: n, .. })
        if *n + nbits <= RAW_ELEMENT_MAX_BITS as u32
    );
    if needs_new {
      assert!(
        self.elements.len() < MAX_HEADER_ELEMENTS,
        "header element overflow"
      );
      self
        .elements
        .push(HeaderElement::RawBits { nbits: 0, bytes: ArrayVec::new() });
    }
    // The current element is raw with room to spare; amend it in place.
    if let Some(HeaderElement::RawBits { nbits: n, bytes }) =
      self.elements.last_mut()
    {
      for i in (0..nbits).rev() {
        let bit = (value >> i) & 1;
        if *n % 8 == 0 {
          bytes.push(0);
        }
        if bit != 0 {
          let last = bytes.len() - 1;
          bytes[last] |= 1 << (7 - (*n % 8));
        }
        *n += 1;
      }
    } else {
      unreachable!();
    }
  }

  pub fn write_bit(&mut self, bit: bool) {
    self.write_bits(bit as u32, 1);
  }

  /// Exp-Golomb ue(v): `Z` zeros, a one, then the low `Z` bits of
  /// `v + 1 - 2^Z`, with `Z = floor(log2(v + 1))`.
  pub fn write_ue(&mut self, v: u32) {
    let z = ((v as u64 + 1).bit_len() - 1) as u32;
    self.write_bits(0, z);
    self.write_bits(1, 1);
    self.write_bits(v + 1 - (1 << z), z);
  }

  /// Exp-Golomb se(v) with the sign mapping the firmware tables expect:
  /// `v > 0` maps to `2v - 1`, `v <= 0` maps to `-2v`.
  pub fn write_se(&mut self, v: i32) {
    let code_num =
      if v > 0 { (2 * v - 1) as u32 } else { (-2i64 * v as i64) as u32 };
    self.write_ue(code_num);
  }

  /// Starts a new token element.
  pub fn push_token(&mut self, token: Token) {
    assert!(
      self.elements.len() < MAX_HEADER_ELEMENTS,
      "header element overflow"
    );
    self.elements.push(HeaderElement::Token(token));
  }

  /// Serializes the element sequence into the firmware wire format:
  /// a count byte, then per element a tag byte (0 for raw, token id
  /// otherwise) followed for raw elements by a bit-count byte and the
  /// packed data bytes.
  pub fn serialize(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(self.elements.len() as u8);
    for element in &self.elements {
      match element {
        HeaderElement::RawBits { nbits, bytes } => {
          out.push(RAW_ELEMENT_TAG);
          out.push(*nbits as u8);
          out.extend_from_slice(bytes);
        }
        HeaderElement::Token(token) => out.push(*token as u8),
      }
    }
    out
  }
}

/// H.264 profiles supported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
  Baseline,
  Main,
}

impl H264Profile {
  pub const fn profile_idc(self) -> u32 {
    match self {
      H264Profile::Baseline => 66,
      H264Profile::Main => 77,
    }
  }

  /// Main profile slices use CABAC; Baseline is CAVLC-only.
  pub const fn cabac(self) -> bool {
    matches!(self, H264Profile::Main)
  }
}

/// HRD values carried into the SPS VUI and buffering-period SEI.
#[derive(Debug, Clone, Copy)]
pub struct H264HrdParams {
  /// Target bitrate in bits per second.
  pub bit_rate: u32,
  /// Coded picture buffer size in bits.
  pub cpb_size: u32,
  /// Initial CPB removal delay in 90 kHz clock ticks.
  pub initial_cpb_removal_delay: u32,
}

const INITIAL_CPB_REMOVAL_DELAY_LENGTH: u32 = 24;
const CPB_REMOVAL_DELAY_LENGTH: u32 = 24;
const DPB_OUTPUT_DELAY_LENGTH: u32 = 24;
const TIME_OFFSET_LENGTH: u32 = 24;

/// Everything the sequence parameter set needs from the session.
#[derive(Debug, Clone, Copy)]
pub struct H264SpsParams {
  pub profile: H264Profile,
  pub level_idc: u8,
  pub width_mbs: u32,
  pub height_mbs: u32,
  /// Right/bottom cropping in pixels when the raw size is not MB-aligned.
  pub crop_right: u32,
  pub crop_bottom: u32,
  pub log2_max_frame_num_minus4: u32,
  pub log2_max_pic_order_cnt_lsb_minus4: u32,
  pub max_num_ref_frames: u32,
  pub frame_rate: u32,
  /// Present when the session is rate-controlled.
  pub hrd: Option<H264HrdParams>,
}

#[derive(Debug, Clone, Copy)]
pub struct H264PpsParams {
  pub profile: H264Profile,
  pub pic_init_qp: u8,
  pub deblock_control_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264SliceType {
  P,
  Idr,
}

#[derive(Debug, Clone, Copy)]
pub struct H264SliceHeaderParams {
  pub slice_type: H264SliceType,
  pub idr_pic_id: u32,
  /// 0 = on, 1 = off, 2 = on except slice edges.
  pub disable_deblocking_filter_idc: u32,
  pub deblock_control_present: bool,
  pub cabac: bool,
}

fn write_nal_start(stream: &mut HeaderElementStream, nal_ref_idc: u32, nal_unit_type: u32) {
  stream.write_bits(1, 32); // start code
  stream.write_bits(0, 1); // forbidden_zero_bit
  stream.write_bits(nal_ref_idc, 2);
  stream.write_bits(nal_unit_type, 5);
}

/// H.264 header syntax, one method per NAL payload.
pub trait H264HeaderWriter {
  fn write_h264_sps(&mut self, sps: &H264SpsParams) -> Result<(), EncoderStatus>;
  fn write_h264_pps(&mut self, pps: &H264PpsParams) -> Result<(), EncoderStatus>;
  fn write_h264_slice_header(
    &mut self, slice: &H264SliceHeaderParams,
  ) -> Result<(), EncoderStatus>;
  fn write_h264_sei_buffering_period(
    &mut self, hrd: &H264HrdParams,
  ) -> Result<(), EncoderStatus>;
  fn write_h264_sei_picture_timing(
    &mut self, cpb_removal_delay: u32, dpb_output_delay: u32,
  ) -> Result<(), EncoderStatus>;
  fn write_h264_aud(&mut self, primary_pic_type: u32) -> Result<(), EncoderStatus>;
  fn write_h264_end_of_sequence(&mut self) -> Result<(), EncoderStatus>;
  fn write_h264_end_of_stream(&mut self) -> Result<(), EncoderStatus>;
}

impl H264HeaderWriter for HeaderElementStream {
  fn write_h264_sps(&mut self, sps: &H264SpsParams) -> Result<(), EncoderStatus> {
    write_nal_start(self, 3, 7);
    self.write_bits(sps.profile.profile_idc(), 8); // profile_idc
    // constraint_set0..5 + reserved_zero_2bits
    let constraint_set1 = matches!(sps.profile, H264Profile::Baseline) as u32;
    self.write_bits(constraint_set1 << 6, 8);
    self.write_bits(sps.level_idc as u32, 8); // level_idc
    self.write_ue(0); // seq_parameter_set_id
    self.write_ue(sps.log2_max_frame_num_minus4);
    self.write_ue(0); // pic_order_cnt_type
    self.write_ue(sps.log2_max_pic_order_cnt_lsb_minus4);
    self.write_ue(sps.max_num_ref_frames);
    self.write_bit(false); // gaps_in_frame_num_value_allowed_flag
    self.write_ue(sps.width_mbs - 1); // pic_width_in_mbs_minus1
    self.write_ue(sps.height_mbs - 1); // pic_height_in_map_units_minus1
    self.write_bit(true); // frame_mbs_only_flag
    self.write_bit(true); // direct_8x8_inference_flag
    let cropping = sps.crop_right != 0 || sps.crop_bottom != 0;
    self.write_bit(cropping); // frame_cropping_flag
    if cropping {
      self.write_ue(0); // frame_crop_left_offset
      self.write_ue(sps.crop_right / 2);
      self.write_ue(0); // frame_crop_top_offset
      self.write_ue(sps.crop_bottom / 2);
    }
    self.write_bit(true); // vui_parameters_present_flag
    self.write_bit(false); // aspect_ratio_info_present_flag
    self.write_bit(false); // overscan_info_present_flag
    self.write_bit(false); // video_signal_type_present_flag
    self.write_bit(false); // chroma_loc_info_present_flag
    self.write_bit(true); // timing_info_present_flag
    self.write_bits(1, 32); // num_units_in_tick
    self.write_bits(sps.frame_rate * 2, 32); // time_scale
    self.write_bit(true); // fixed_frame_rate_flag
    self.write_bit(sps.hrd.is_some()); // nal_hrd_parameters_present_flag
    if let Some(hrd) = sps.hrd {
      self.write_ue(0); // cpb_cnt_minus1
      self.write_bits(0, 4); // bit_rate_scale
      self.write_bits(0, 4); // cpb_size_scale
      // Rates are coded in 64- and 16-bit units; sub-unit values floor
      // at one unit so the minus-1 fields cannot underflow.
      self.write_ue((hrd.bit_rate >> 6).max(1) - 1); // bit_rate_value_minus1
      self.write_ue((hrd.cpb_size >> 4).max(1) - 1); // cpb_size_value_minus1
      self.write_bit(true); // cbr_flag
      self.write_bits(INITIAL_CPB_REMOVAL_DELAY_LENGTH - 1, 5);
      self.write_bits(CPB_REMOVAL_DELAY_LENGTH - 1, 5);
      self.write_bits(DPB_OUTPUT_DELAY_LENGTH - 1, 5);
      self.write_bits(TIME_OFFSET_LENGTH, 5);
    }
    self.write_bit(false); // vcl_hrd_parameters_present_flag
    if sps.hrd.is_some() {
      self.write_bit(false); // low_delay_hrd_flag
    }
    self.write_bit(false); // pic_struct_present_flag
    self.write_bit(false); // bitstream_restriction_flag
    self.push_token(Token::ByteAlignH264);
    Ok(())
  }

  fn write_h264_pps(&mut self, pps: &H264PpsParams) -> Result<(), EncoderStatus> {
    write_nal_start(self, 3, 8);
    self.write_ue(0); // pic_parameter_set_id
    self.write_ue(0); // seq_parameter_set_id
    self.write_bit(pps.profile.cabac()); // entropy_coding_mode_flag
    self.write_bit(false); // bottom_field_pic_order_in_frame_present_flag
    self.write_ue(0); // num_slice_groups_minus1
    self.write_ue(0); // num_ref_idx_l0_default_active_minus1
    self.write_ue(0); // num_ref_idx_l1_default_active_minus1
    self.write_bit(false); // weighted_pred_flag
    self.write_bits(0, 2); // weighted_bipred_idc
    self.write_se(pps.pic_init_qp as i32 - 26); // pic_init_qp_minus26
    self.write_se(0); // pic_init_qs_minus26
    self.write_se(0); // chroma_qp_index_offset
    self.write_bit(pps.deblock_control_present);
    self.write_bit(false); // constrained_intra_pred_flag
    self.write_bit(false); // redundant_pic_cnt_present_flag
    self.push_token(Token::ByteAlignH264);
    Ok(())
  }

  fn write_h264_slice_header(
    &mut self, slice: &H264SliceHeaderParams,
  ) -> Result<(), EncoderStatus> {
    let (nal_ref_idc, nal_unit_type) = match slice.slice_type {
      H264SliceType::Idr => (3, 5),
      H264SliceType::P => (2, 1),
    };
    write_nal_start(self, nal_ref_idc, nal_unit_type);
    self.push_token(Token::CurrMbAddr); // first_mb_in_slice
    match slice.slice_type {
      H264SliceType::Idr => self.write_ue(2), // slice_type: I
      H264SliceType::P => self.write_ue(0),   // slice_type: P
    }
    self.write_ue(0); // pic_parameter_set_id
    self.push_token(Token::FrameNum); // frame_num
    if slice.slice_type == H264SliceType::Idr {
      self.write_ue(slice.idr_pic_id);
    }
    self.push_token(Token::PicOrderCnt); // pic_order_cnt_lsb
    if slice.slice_type == H264SliceType::P {
      self.write_bit(false); // num_ref_idx_active_override_flag
      self.push_token(Token::ReorderL0); // ref_pic_list_modification
    }
    // nal_ref_idc is never zero for our slices, so marking always follows.
    self.push_token(Token::AdaptiveMarking); // dec_ref_pic_marking
    if slice.cabac && slice.slice_type == H264SliceType::P {
      self.write_ue(0); // cabac_init_idc
    }
    self.push_token(Token::Qp); // slice_qp_delta
    if slice.deblock_control_present {
      self.write_ue(slice.disable_deblocking_filter_idc);
      if slice.disable_deblocking_filter_idc != 1 {
        self.write_se(0); // slice_alpha_c0_offset_div2
        self.write_se(0); // slice_beta_offset_div2
      }
    }
    Ok(())
  }

  fn write_h264_sei_buffering_period(
    &mut self, hrd: &H264HrdParams,
  ) -> Result<(), EncoderStatus> {
    write_nal_start(self, 0, 6);
    self.write_bits(0, 8); // payload type: buffering_period
    // seq_parameter_set_id ue(0) + one CPB entry + payload alignment.
    let payload_bits = 1 + 2 * INITIAL_CPB_REMOVAL_DELAY_LENGTH;
    self.write_bits((payload_bits + 7) / 8, 8); // payload size in bytes
    self.write_ue(0); // seq_parameter_set_id
    self.write_bits(
      hrd.initial_cpb_removal_delay,
      INITIAL_CPB_REMOVAL_DELAY_LENGTH,
    );
    self.write_bits(0, INITIAL_CPB_REMOVAL_DELAY_LENGTH); // offset
    self.write_bit(true); // payload alignment stop bit
    self.push_token(Token::ByteAlignH264);
    Ok(())
  }

  fn write_h264_sei_picture_timing(
    &mut self, cpb_removal_delay: u32, dpb_output_delay: u32,
  ) -> Result<(), EncoderStatus> {
    write_nal_start(self, 0, 6);
    self.write_bits(1, 8); // payload type: pic_timing
    let payload_bits = CPB_REMOVAL_DELAY_LENGTH + DPB_OUTPUT_DELAY_LENGTH;
    self.write_bits((payload_bits + 7) / 8, 8);
    self.write_bits(cpb_removal_delay, CPB_REMOVAL_DELAY_LENGTH);
    self.write_bits(dpb_output_delay, DPB_OUTPUT_DELAY_LENGTH);
    self.push_token(Token::ByteAlignH264);
    Ok(())
  }

  fn write_h264_aud(&mut self, primary_pic_type: u32) -> Result<(), EncoderStatus> {
    write_nal_start(self, 0, 9);
    self.write_bits(primary_pic_type, 3);
    self.push_token(Token::ByteAlignH264);
    Ok(())
  }

  fn write_h264_end_of_sequence(&mut self) -> Result<(), EncoderStatus> {
    write_nal_start(self, 0, 10);
    Ok(())
  }

  fn write_h264_end_of_stream(&mut self) -> Result<(), EncoderStatus> {
    write_nal_start(self, 0, 11);
    Ok(())
  }
}

/// MPEG-4 VBV values for the VOL header.
#[derive(Debug, Clone, Copy)]
pub struct Mpeg4VbvParams {
  /// In units of 400 bits per second.
  pub bit_rate: u32,
  /// In units of 16384 bits.
  pub buffer_size: u32,
  /// In units of 64 bits.
  pub occupancy: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Mpeg4VolParams {
  pub profile_and_level: u8,
  pub width: u32,
  pub height: u32,
  pub vop_time_increment_resolution: u32,
  pub vbv: Option<Mpeg4VbvParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mpeg4VopType {
  I,
  P,
}

/// MPEG-4 visual syntax: VOS/VO/VOL sequence headers and VOP headers.
pub trait Mpeg4HeaderWriter {
  fn write_mpeg4_sequence_header(
    &mut self, vol: &Mpeg4VolParams,
  ) -> Result<(), EncoderStatus>;
  fn write_mpeg4_vop_header(
    &mut self, vop_type: Mpeg4VopType, fcode_forward: u32,
  ) -> Result<(), EncoderStatus>;
}

impl Mpeg4HeaderWriter for HeaderElementStream {
  fn write_mpeg4_sequence_header(
    &mut self, vol: &Mpeg4VolParams,
  ) -> Result<(), EncoderStatus> {
    self.write_bits(0x000001b0, 32); // visual_object_sequence_start_code
    self.write_bits(vol.profile_and_level as u32, 8);
    self.write_bits(0x000001b5, 32); // visual_object_start_code
    self.write_bit(false); // is_visual_object_identifier
    self.write_bits(1, 4); // visual_object_type: video
    self.write_bit(false); // video_signal_type
    self.push_token(Token::ByteAlignMpeg4);
    self.write_bits(0x00000100, 32); // video_object_start_code
    self.write_bits(0x00000120, 32); // video_object_layer_start_code
    self.write_bit(false); // random_accessible_vol
    self.write_bits(1, 8); // video_object_type_indication: simple
    self.write_bit(false); // is_object_layer_identifier
    self.write_bits(1, 4); // aspect_ratio_info: square
    self.write_bit(true); // vol_control_parameters
    self.write_bits(1, 2); // chroma_format: 4:2:0
    self.write_bit(true); // low_delay
    self.write_bit(vol.vbv.is_some()); // vbv_parameters
    if let Some(vbv) = vol.vbv {
      self.write_bits(vbv.bit_rate >> 15, 15); // first_half_bit_rate
      self.write_bit(true); // marker
      self.write_bits(vbv.bit_rate & 0x7fff, 15);
      self.write_bit(true); // marker
      self.write_bits(vbv.buffer_size >> 3, 15); // first_half_vbv_buffer_size
      self.write_bit(true); // marker
      self.write_bits(vbv.buffer_size & 0x7, 3);
      self.write_bits(vbv.occupancy >> 15, 11); // first_half_vbv_occupancy
      self.write_bit(true); // marker
      self.write_bits(vbv.occupancy & 0x7fff, 15);
      self.write_bit(true); // marker
    }
    self.write_bits(0, 2); // video_object_layer_shape: rectangular
    self.write_bit(true); // marker
    self.write_bits(vol.vop_time_increment_resolution, 16);
    self.write_bit(true); // marker
    self.write_bit(false); // fixed_vop_rate
    self.write_bit(true); // marker
    self.write_bits(vol.width, 13); // video_object_layer_width
    self.write_bit(true); // marker
    self.write_bits(vol.height, 13); // video_object_layer_height
    self.write_bit(true); // marker
    self.write_bit(false); // interlaced
    self.write_bit(true); // obmc_disable
    self.write_bit(false); // sprite_enable
    self.write_bit(false); // not_8_bit
    self.write_bit(false); // quant_type
    self.write_bit(true); // complexity_estimation_disable
    self.write_bit(true); // resync_marker_disable
    self.write_bit(false); // data_partitioned
    self.write_bit(false); // scalability
    self.push_token(Token::ByteAlignMpeg4);
    Ok(())
  }

  fn write_mpeg4_vop_header(
    &mut self, vop_type: Mpeg4VopType, fcode_forward: u32,
  ) -> Result<(), EncoderStatus> {
    self.write_bits(0x000001b6, 32); // vop_start_code
    match vop_type {
      Mpeg4VopType::I => self.write_bits(0, 2),
      Mpeg4VopType::P => self.write_bits(1, 2),
    }
    // modulo_time_base, marker, vop_time_increment, marker.
    self.push_token(Token::TimeReference);
    self.write_bit(true); // vop_coded
    if vop_type == Mpeg4VopType::P {
      self.write_bit(false); // vop_rounding_type
    }
    self.write_bits(0, 3); // intra_dc_vlc_thr
    self.push_token(Token::Qp); // vop_quant
    if vop_type == Mpeg4VopType::P {
      self.write_bits(fcode_forward, 3); // vop_fcode_forward
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H263PictureType {
  I,
  P,
}

/// Baseline H.263 picture-layer syntax. GOB headers are generated by the
/// firmware; the host only emits the picture header.
pub trait H263HeaderWriter {
  fn write_h263_picture_header(
    &mut self, picture_type: H263PictureType, width: u32, height: u32,
  ) -> Result<(), EncoderStatus>;
}

/// Standard source formats expressible in the 3-bit PTYPE field.
fn h263_source_format(width: u32, height: u32) -> Option<u32> {
  match (width, height) {
    (128, 96) => Some(1),   // sub-QCIF
    (176, 144) => Some(2),  // QCIF
    (352, 288) => Some(3),  // CIF
    (704, 576) => Some(4),  // 4CIF
    (1408, 1152) => Some(5), // 16CIF
    _ => None,
  }
}

impl H263HeaderWriter for HeaderElementStream {
  fn write_h263_picture_header(
    &mut self, picture_type: H263PictureType, width: u32, height: u32,
  ) -> Result<(), EncoderStatus> {
    let source_format =
      h263_source_format(width, height).ok_or(EncoderStatus::Unsupported)?;
    self.write_bits(0x20, 22); // picture start code
    self.push_token(Token::FrameNum); // temporal reference
    // PTYPE
    self.write_bit(true); // marker
    self.write_bit(false); // always zero
    self.write_bit(false); // split screen indicator
    self.write_bit(false); // document camera indicator
    self.write_bit(false); // full picture freeze release
    self.write_bits(source_format, 3);
    self.write_bit(picture_type == H263PictureType::P);
    self.write_bit(false); // unrestricted motion vector mode
    self.write_bit(false); // syntax-based arithmetic coding
    self.write_bit(false); // advanced prediction mode
    self.write_bit(false); // PB-frames mode
    self.push_token(Token::Qp); // PQUANT
    self.write_bit(false); // CPM
    self.write_bit(false); // PEI
    Ok(())
  }
}
