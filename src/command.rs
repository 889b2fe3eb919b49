// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Picture/slice command assembly.
//!
//! Builds the per-core command packages for one picture and owns the
//! slice-to-core schedule. Cores are filled in descending-then-wrapping
//! order so core 0, the master, always receives the numerically last slice
//! of a picture and therefore finishes last. Start-picture commands are
//! likewise issued in reverse core order.

use crate::hwmem::BufferHandle;
use crate::params::SliceParams;

use arrayvec::ArrayVec;
use bitstream_io::{BitWrite, BitWriter, LittleEndian};
use num_derive::FromPrimitive;

/// Parallel encode cores the hardware exposes.
pub const MAX_CORES: usize = 4;
/// Firmware limit on slices in one picture.
pub const MAX_SLICES_PER_PICTURE: usize = 32;

/// Command opcodes (wire ABI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CmdOpcode {
  /// No-op filler for a core left without work.
  Pad = 0,
  StartPicture = 1,
  DoHeader = 2,
  EncodeSlice = 3,
  EndPicture = 4,
  RegisterWrite = 5,
  NewCodec = 6,
}

/// Command parameters: small inline words, or a reference into a mapped
/// buffer for bulk data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdPayload {
  Inline(ArrayVec<u32, 4>),
  Indirect { buffer: BufferHandle, offset: u32 },
}

/// One hardware command, immutable once queued (padding rewrites excepted,
/// see [`CommandAssembler::set_slice_count`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPackage {
  pub core: u8,
  pub opcode: CmdOpcode,
  pub payload: CmdPayload,
}

impl CommandPackage {
  /// 32-bit command header: opcode in [7:0], core in [10:8], payload word
  /// count in [31:16].
  fn header_word(&self) -> u32 {
    let words = match &self.payload {
      CmdPayload::Inline(words) => words.len() as u32,
      CmdPayload::Indirect { .. } => 2,
    };
    self.opcode as u32 | ((self.core as u32) << 8) | (words << 16)
  }
}

/// Round-robin slice-to-core assignment, descending so core 0 takes the
/// last slice. Also tracks per-core submission order.
#[derive(Debug)]
pub struct SliceCursor {
  next_core: usize,
  last_slice_per_core: [Option<usize>; MAX_CORES],
}

impl SliceCursor {
  fn new() -> Self {
    SliceCursor { next_core: 0, last_slice_per_core: [None; MAX_CORES] }
  }

  /// Positions the cursor so that slice `slice_count - 1` lands on core 0.
  fn reset(&mut self, active_cores: usize, slice_count: usize) {
    debug_assert!(active_cores > 0 && slice_count > 0);
    self.next_core = (slice_count - 1) % active_cores;
    self.last_slice_per_core = [None; MAX_CORES];
  }

  fn assign(&mut self, slice_index: usize, active_cores: usize) -> usize {
    let core = self.next_core;
    if let Some(last) = self.last_slice_per_core[core] {
      assert!(last < slice_index, "slice submitted out of order");
    }
    self.last_slice_per_core[core] = Some(slice_index);
    self.next_core = if core == 0 { active_cores - 1 } else { core - 1 };
    core
  }
}

/// Assembles and flushes the command stream for one picture at a time.
pub struct CommandAssembler {
  core_count: usize,
  active_core_count: usize,
  commands: Vec<CommandPackage>,
  cursor: SliceCursor,
  start_cmd_index: [Option<usize>; MAX_CORES],
  slice_count: Option<usize>,
  slices_queued: usize,
  in_picture: bool,
}

impl CommandAssembler {
  pub fn new(core_count: usize) -> Self {
    assert!(core_count >= 1 && core_count <= MAX_CORES);
    CommandAssembler {
      core_count,
      active_core_count: core_count,
      commands: Vec::with_capacity(64),
      cursor: SliceCursor::new(),
      start_cmd_index: [None; MAX_CORES],
      slice_count: None,
      slices_queued: 0,
      in_picture: false,
    }
  }

  pub fn active_core_count(&self) -> usize {
    self.active_core_count
  }

  pub fn commands(&self) -> &[CommandPackage] {
    &self.commands
  }

  /// Announces a codec switch to every core.
  pub fn queue_new_codec(&mut self, codec_id: u32) {
    for core in (0..self.core_count).rev() {
      let mut words = ArrayVec::new();
      words.push(codec_id);
      self.commands.push(CommandPackage {
        core: core as u8,
        opcode: CmdOpcode::NewCodec,
        payload: CmdPayload::Inline(words),
      });
    }
  }

  /// Opens a picture: start-picture on every core, in reverse core order
  /// so core 0 is released last. The previous picture must have been
  /// closed; the master core's end-picture always precedes the next
  /// start-picture.
  pub fn begin_picture(&mut self, pic_params: BufferHandle, offset: u32) {
    assert!(!self.in_picture, "begin_picture while picture open");
    self.in_picture = true;
    self.active_core_count = self.core_count;
    self.slice_count = None;
    self.slices_queued = 0;
    self.start_cmd_index = [None; MAX_CORES];
    for core in (0..self.core_count).rev() {
      self.start_cmd_index[core] = Some(self.commands.len());
      self.commands.push(CommandPackage {
        core: core as u8,
        opcode: CmdOpcode::StartPicture,
        payload: CmdPayload::Indirect { buffer: pic_params, offset },
      });
    }
  }

  /// Fixes the slice count for the open picture. With fewer slices than
  /// cores, the surplus cores' start-picture commands are rewritten to
  /// no-op pads and the active core count shrinks to the slice count.
  /// Must run before any slice command is queued.
  pub fn set_slice_count(&mut self, slice_count: usize) {
    assert!(self.in_picture, "set_slice_count with no picture open");
    assert!(self.slices_queued == 0, "slice count fixed after first slice");
    assert!(
      slice_count >= 1 && slice_count <= MAX_SLICES_PER_PICTURE,
      "invalid slice count"
    );
    if slice_count < self.active_core_count {
      for core in slice_count..self.active_core_count {
        let index = self.start_cmd_index[core]
          .expect("start-picture queued for every core");
        self.commands[index].opcode = CmdOpcode::Pad;
        self.commands[index].payload = CmdPayload::Inline(ArrayVec::new());
      }
      self.active_core_count = slice_count;
    }
    self.slice_count = Some(slice_count);
    self.cursor.reset(self.active_core_count, slice_count);
  }

  /// Emits the per-core bias table as one register-write block before the
  /// core's first encode-slice command.
  pub fn queue_bias_tables(&mut self, buffer: BufferHandle, offset: u32) {
    assert!(self.in_picture, "bias tables with no picture open");
    assert!(self.slices_queued == 0, "bias tables after first slice");
    for core in (0..self.active_core_count).rev() {
      self.commands.push(CommandPackage {
        core: core as u8,
        opcode: CmdOpcode::RegisterWrite,
        payload: CmdPayload::Indirect { buffer, offset },
      });
    }
  }

  /// Queues a sequence- or picture-level header on the core that will
  /// encode the next slice, so the firmware emits it ahead of that slice's
  /// bits.
  pub fn queue_header(&mut self, buffer: BufferHandle, offset: u32) {
    assert!(self.in_picture, "queue_header with no picture open");
    assert!(
      self.slice_count.is_some(),
      "queue_header before set_slice_count"
    );
    self.commands.push(CommandPackage {
      core: self.cursor.next_core as u8,
      opcode: CmdOpcode::DoHeader,
      payload: CmdPayload::Indirect { buffer, offset },
    });
  }

  /// Queues one slice: do-header for its header region, then encode-slice
  /// with the inline macroblock range, both on the core the cursor picks.
  pub fn queue_slice(
    &mut self, header_buffer: BufferHandle, header_offset: u32,
    slice: &SliceParams, width_mbs: u32,
  ) -> usize {
    assert!(self.in_picture, "queue_slice with no picture open");
    let slice_count =
      self.slice_count.expect("queue_slice before set_slice_count");
    assert!(self.slices_queued < slice_count, "more slices than declared");

    let slice_index = self.slices_queued;
    let core = self.cursor.assign(slice_index, self.active_core_count);
    self.commands.push(CommandPackage {
      core: core as u8,
      opcode: CmdOpcode::DoHeader,
      payload: CmdPayload::Indirect {
        buffer: header_buffer,
        offset: header_offset,
      },
    });
    let mut words = ArrayVec::new();
    words.push(slice.start_row * width_mbs);
    words.push(slice.height_in_rows * width_mbs);
    words.push(
      slice.intra as u32 | (slice.disable_deblocking_filter_idc << 1),
    );
    self.commands.push(CommandPackage {
      core: core as u8,
      opcode: CmdOpcode::EncodeSlice,
      payload: CmdPayload::Inline(words),
    });
    self.slices_queued += 1;
    core
  }

  /// Closes the picture with end-picture on every active core, core 0
  /// last in issue order but the last to finish on the hardware.
  pub fn end_picture(&mut self) {
    assert!(self.in_picture, "end_picture with no picture open");
    assert_eq!(
      self.slices_queued,
      self.slice_count.unwrap_or(0),
      "picture closed with slices missing"
    );
    for core in (0..self.active_core_count).rev() {
      self.commands.push(CommandPackage {
        core: core as u8,
        opcode: CmdOpcode::EndPicture,
        payload: CmdPayload::Inline(ArrayVec::new()),
      });
    }
    self.in_picture = false;
  }

  /// Serializes and drains the queued commands into the little-endian
  /// word stream the firmware consumes.
  pub fn flush(&mut self) -> Vec<u8> {
    let mut writer = BitWriter::endian(Vec::new(), LittleEndian);
    for cmd in &self.commands {
      // Writes cannot fail against a Vec.
      writer.write(32, cmd.header_word()).unwrap();
      match &cmd.payload {
        CmdPayload::Inline(words) => {
          for &word in words {
            writer.write(32, word).unwrap();
          }
        }
        CmdPayload::Indirect { buffer, offset } => {
          writer.write(32, buffer.0).unwrap();
          writer.write(32, *offset).unwrap();
        }
      }
    }
    self.commands.clear();
    writer.into_writer()
  }

  /// Drops the queued commands after a failed picture; the caller resets
  /// its own bookkeeping.
  pub fn invalidate(&mut self) {
    self.commands.clear();
    self.in_picture = false;
    self.slice_count = None;
    self.slices_queued = 0;
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use num_traits::FromPrimitive;
  use quickcheck::quickcheck;

  fn slice_row(start_row: u32, rows: u32) -> SliceParams {
    SliceParams {
      start_row,
      height_in_rows: rows,
      intra: false,
      disable_deblocking_filter_idc: 1,
    }
  }

  fn open_picture(cores: usize, slices: usize) -> CommandAssembler {
    let mut asm = CommandAssembler::new(cores);
    asm.begin_picture(BufferHandle(1), 0);
    asm.set_slice_count(slices);
    asm
  }

  #[test]
  fn start_picture_reverse_core_order() {
    let mut asm = CommandAssembler::new(4);
    asm.begin_picture(BufferHandle(1), 0);
    let cores: Vec<u8> = asm.commands().iter().map(|c| c.core).collect();
    assert_eq!(cores, vec![3, 2, 1, 0]);
  }

  #[test]
  fn core0_gets_last_slice() {
    for cores in 1..=MAX_CORES {
      for slices in 1..=12 {
        let mut asm = open_picture(cores, slices);
        let mut last_core = None;
        for i in 0..slices {
          let core = asm.queue_slice(
            BufferHandle(2),
            0,
            &slice_row(i as u32, 1),
            80,
          );
          assert!(core < asm.active_core_count());
          last_core = Some(core);
        }
        assert_eq!(last_core, Some(0), "{cores} cores, {slices} slices");
        asm.end_picture();
      }
    }
  }

  quickcheck! {
    fn active_cores_bounded(cores: u8, slices: u8) -> bool {
      let cores = usize::from(cores % MAX_CORES as u8) + 1;
      let slices = usize::from(slices % 12) + 1;
      let mut asm = open_picture(cores, slices);
      for i in 0..slices {
        asm.queue_slice(BufferHandle(2), 0, &slice_row(i as u32, 1), 80);
      }
      asm.end_picture();
      asm.active_core_count() <= cores && asm.active_core_count() <= slices
    }
  }

  #[test]
  fn surplus_cores_padded_before_slices() {
    let mut asm = CommandAssembler::new(4);
    asm.begin_picture(BufferHandle(1), 0);
    asm.set_slice_count(3);
    assert_eq!(asm.active_core_count(), 3);
    // Core 3's start-picture has become a pad, in place.
    let pads: Vec<&CommandPackage> = asm
      .commands()
      .iter()
      .filter(|c| c.opcode == CmdOpcode::Pad)
      .collect();
    assert_eq!(pads.len(), 1);
    assert_eq!(pads[0].core, 3);
    assert!(asm
      .commands()
      .iter()
      .all(|c| c.opcode != CmdOpcode::EncodeSlice));
  }

  #[test]
  fn per_core_command_order() {
    let mut asm = open_picture(2, 4);
    asm.queue_bias_tables(BufferHandle(9), 256);
    for i in 0..4 {
      asm.queue_slice(BufferHandle(2), i * 128, &slice_row(i, 1), 80);
    }
    asm.end_picture();
    for core in 0..2u8 {
      let ops: Vec<CmdOpcode> = asm
        .commands()
        .iter()
        .filter(|c| c.core == core)
        .map(|c| c.opcode)
        .collect();
      assert_eq!(
        ops,
        vec![
          CmdOpcode::StartPicture,
          CmdOpcode::RegisterWrite,
          CmdOpcode::DoHeader,
          CmdOpcode::EncodeSlice,
          CmdOpcode::DoHeader,
          CmdOpcode::EncodeSlice,
          CmdOpcode::EndPicture,
        ]
      );
    }
  }

  #[test]
  #[should_panic(expected = "begin_picture while picture open")]
  fn reopening_picture_panics() {
    let mut asm = CommandAssembler::new(2);
    asm.begin_picture(BufferHandle(1), 0);
    asm.begin_picture(BufferHandle(1), 0);
  }

  #[test]
  #[should_panic(expected = "queue_slice before set_slice_count")]
  fn slice_without_count_panics() {
    let mut asm = CommandAssembler::new(2);
    asm.begin_picture(BufferHandle(1), 0);
    asm.queue_slice(BufferHandle(2), 0, &slice_row(0, 1), 80);
  }

  #[test]
  #[should_panic(expected = "invalid slice count")]
  fn too_many_slices_panics() {
    let mut asm = CommandAssembler::new(2);
    asm.begin_picture(BufferHandle(1), 0);
    asm.set_slice_count(MAX_SLICES_PER_PICTURE + 1);
  }

  #[test]
  fn flushed_words_decode_back() {
    let mut asm = open_picture(1, 1);
    asm.queue_slice(BufferHandle(7), 640, &slice_row(0, 45), 80);
    asm.end_picture();
    let bytes = asm.flush();
    assert!(asm.commands().is_empty());

    let words: Vec<u32> = bytes
      .chunks_exact(4)
      .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
      .collect();
    // start-picture (header + 2), do-header (header + 2),
    // encode-slice (header + 3), end-picture (header).
    assert_eq!(words.len(), 3 + 3 + 4 + 1);
    let header = words[0];
    assert_eq!(
      CmdOpcode::from_u8((header & 0xff) as u8),
      Some(CmdOpcode::StartPicture)
    );
    assert_eq!((header >> 8) & 0x7, 0); // core
    assert_eq!(header >> 16, 2); // payload words
    let enc_header = words[6];
    assert_eq!(
      CmdOpcode::from_u8((enc_header & 0xff) as u8),
      Some(CmdOpcode::EncodeSlice)
    );
    assert_eq!(words[8], 45 * 80); // macroblock count
  }
}
