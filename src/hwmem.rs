// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Hardware memory plumbing at the interface boundary.
//!
//! The buffer-object service itself (GPU allocation, DMA placement, ioctl
//! submission) lives outside this crate; here it is a trait plus the two
//! structures the encode core needs on top of it: a named, size-checked
//! header-memory arena, and a bounded command-buffer pool whose reuse is
//! gated on per-generation completion fences.

use crate::api::EncoderStatus;

use std::ops::Range;

/// Opaque name of a buffer object held by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Where the buffer must be reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// CPU- and hardware-visible.
  Shared,
  /// Hardware-only.
  DeviceOnly,
}

/// Buffer-object service provided by the driver layer.
pub trait BufferService {
  fn create(
    &mut self, size: usize, placement: Placement,
  ) -> Result<BufferHandle, EncoderStatus>;
  /// Copies staged bytes into the buffer. Models the map/write/unmap
  /// cycle; the buffer is unmapped again when this returns, as required
  /// before hardware submission.
  fn upload(
    &mut self, buffer: BufferHandle, offset: usize, bytes: &[u8],
  ) -> Result<(), EncoderStatus>;
  fn destroy(&mut self, buffer: BufferHandle);
}

/// Completion handle for one submitted command-buffer generation.
pub trait CompletionFence {
  fn is_signaled(&self) -> bool;
  /// Blocks until the hardware job has retired.
  fn wait(&self);
}

/// Named sub-regions of the shared header memory. Each codec header is
/// serialized into its own fixed slot so firmware can address them without
/// the host doing offset arithmetic by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRegion {
  Sequence,
  Picture,
  EndOfSequence,
  EndOfStream,
  Aud,
  SeiBufferingPeriod,
  SeiPictureTiming,
  Slice(usize),
}

/// Bytes reserved per region. The largest real header, an H.264 SPS
/// carrying HRD parameters, serializes to under 48 bytes; writes are
/// bounds-checked and oversized payloads rejected rather than truncated.
pub const HEADER_REGION_SIZE: usize = 128;

const FIXED_REGIONS: usize = 7;

/// Region offsets within the header memory buffer.
#[derive(Debug, Clone, Copy)]
pub struct HeaderMemLayout {
  max_slices: usize,
}

impl HeaderMemLayout {
  pub const fn new(max_slices: usize) -> Self {
    HeaderMemLayout { max_slices }
  }

  pub const fn total_size(&self) -> usize {
    (FIXED_REGIONS + self.max_slices) * HEADER_REGION_SIZE
  }

  fn index(&self, region: HeaderRegion) -> usize {
    match region {
      HeaderRegion::Sequence => 0,
      HeaderRegion::Picture => 1,
      HeaderRegion::EndOfSequence => 2,
      HeaderRegion::EndOfStream => 3,
      HeaderRegion::Aud => 4,
      HeaderRegion::SeiBufferingPeriod => 5,
      HeaderRegion::SeiPictureTiming => 6,
      HeaderRegion::Slice(i) => {
        assert!(i < self.max_slices, "slice region out of range");
        FIXED_REGIONS + i
      }
    }
  }

  pub fn range(&self, region: HeaderRegion) -> Range<usize> {
    let base = self.index(region) * HEADER_REGION_SIZE;
    base..base + HEADER_REGION_SIZE
  }
}

/// CPU-side staging arena for header memory. All writes are bounds-checked
/// against the owning region.
#[derive(Debug)]
pub struct HeaderMem {
  layout: HeaderMemLayout,
  bytes: Vec<u8>,
}

impl HeaderMem {
  pub fn new(layout: HeaderMemLayout) -> Self {
    HeaderMem { layout, bytes: vec![0; layout.total_size()] }
  }

  /// Writes a serialized header into its region, returning the byte offset
  /// the firmware will read it from.
  pub fn write(
    &mut self, region: HeaderRegion, payload: &[u8],
  ) -> Result<u32, EncoderStatus> {
    let range = self.layout.range(region);
    if payload.len() > range.len() {
      return Err(EncoderStatus::CommandBufferOverflow);
    }
    let offset = range.start;
    self.bytes[offset..offset + payload.len()].copy_from_slice(payload);
    Ok(offset as u32)
  }

  pub fn offset_of(&self, region: HeaderRegion) -> u32 {
    self.layout.range(region).start as u32
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }
}

/// Command-buffer generations kept in flight. Acquiring a buffer for
/// picture N therefore waits, at most, on picture N-2 retiring.
pub const CMD_BUF_GENERATIONS: usize = 2;

struct CmdBufSlot {
  handle: BufferHandle,
  fence: Option<Box<dyn CompletionFence>>,
}

/// Bounded pool of command buffers with explicit per-generation completion
/// handles, instead of side-channel "is the old job done" polling.
pub struct CmdBufPool {
  slots: Vec<CmdBufSlot>,
  next: usize,
}

impl CmdBufPool {
  pub fn new<S: BufferService>(
    service: &mut S, buf_size: usize,
  ) -> Result<Self, EncoderStatus> {
    let mut slots = Vec::with_capacity(CMD_BUF_GENERATIONS);
    for _ in 0..CMD_BUF_GENERATIONS {
      slots.push(CmdBufSlot {
        handle: service.create(buf_size, Placement::Shared)?,
        fence: None,
      });
    }
    Ok(CmdBufPool { slots, next: 0 })
  }

  /// Claims the next buffer, blocking until its previous hardware job (two
  /// generations back) has retired.
  pub fn acquire(&mut self) -> BufferHandle {
    let slot = &mut self.slots[self.next];
    if let Some(fence) = slot.fence.take() {
      fence.wait();
    }
    self.next = (self.next + 1) % CMD_BUF_GENERATIONS;
    slot.handle
  }

  /// Records the completion handle for the generation just submitted.
  pub fn attach_fence(
    &mut self, buffer: BufferHandle, fence: Box<dyn CompletionFence>,
  ) {
    if let Some(slot) =
      self.slots.iter_mut().find(|slot| slot.handle == buffer)
    {
      slot.fence = Some(fence);
    }
  }

  pub fn destroy<S: BufferService>(self, service: &mut S) {
    for slot in self.slots {
      if let Some(fence) = slot.fence {
        fence.wait();
      }
      service.destroy(slot.handle);
    }
  }
}


#[cfg(test)]
mod test {
  use super::testutil::*;
  use super::*;
  use std::cell::RefCell;
  use std::rc::Rc;

  #[test]
  fn header_regions_do_not_overlap() {
    let layout = HeaderMemLayout::new(4);
    let regions = [
      HeaderRegion::Sequence,
      HeaderRegion::Picture,
      HeaderRegion::EndOfSequence,
      HeaderRegion::EndOfStream,
      HeaderRegion::Aud,
      HeaderRegion::SeiBufferingPeriod,
      HeaderRegion::SeiPictureTiming,
      HeaderRegion::Slice(0),
      HeaderRegion::Slice(3),
    ];
    for (i, a) in regions.iter().enumerate() {
      for b in regions.iter().skip(i + 1) {
        let ra = layout.range(*a);
        let rb = layout.range(*b);
        assert!(ra.end <= rb.start || rb.end <= ra.start);
      }
    }
    assert_eq!(layout.total_size(), 11 * HEADER_REGION_SIZE);
  }

  #[test]
  fn oversized_header_is_rejected() {
    let mut mem = HeaderMem::new(HeaderMemLayout::new(1));
    let payload = vec![0u8; HEADER_REGION_SIZE + 1];
    assert_eq!(
      mem.write(HeaderRegion::Sequence, &payload),
      Err(EncoderStatus::CommandBufferOverflow)
    );
  }

  #[test]
  #[should_panic(expected = "slice region out of range")]
  fn slice_region_out_of_range_panics() {
    let layout = HeaderMemLayout::new(2);
    let _ = layout.range(HeaderRegion::Slice(2));
  }

  #[test]
  fn pool_waits_on_two_generations_back() {
    let mut service = FakeBufferService::default();
    let mut pool = CmdBufPool::new(&mut service, 4096).unwrap();
    let waited = Rc::new(RefCell::new(0));

    let a = pool.acquire();
    pool.attach_fence(a, Box::new(CountingFence { waited: waited.clone() }));
    let b = pool.acquire();
    assert_ne!(a, b);
    assert_eq!(*waited.borrow(), 0);

    // Third acquire reuses the first buffer and must wait for its job.
    let c = pool.acquire();
    assert_eq!(a, c);
    assert_eq!(*waited.borrow(), 1);

    pool.destroy(&mut service);
    assert!(service.buffers.is_empty());
  }
}
