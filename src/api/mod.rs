// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Contains the public session API.
//!
//! A session is created from a validated [`Config`] and driven through the
//! begin-picture / render / end-picture cycle by a single thread:
//!
//! ```ignore
//! let mut session = Config::new()
//!   .with_encoder_config(enc)
//!   .new_session(service)?;
//! session.begin_picture()?;
//! session.render(BufferKind::Sequence, &seq_blob)?;
//! session.render(BufferKind::Picture, &pic_blob)?;
//! session.render(BufferKind::Slice, &slice_blob)?;
//! session.end_picture()?;
//! ```

mod config;
pub(crate) mod internal;

pub use config::*;

use crate::hwmem::{BufferService, CompletionFence};
use crate::params::BufferKind;

use internal::SessionInner;
use thiserror::Error;

/// Runtime errors of an encode session. Sequencing mistakes (a render
/// with no open picture, nested begin-picture) are caller bugs and panic
/// instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// A parameter buffer was malformed or truncated; the picture was
  /// aborted with no partial state.
  #[error("malformed or truncated parameter buffer")]
  InvalidInput,
  /// A required surface or coded-buffer handle was absent.
  #[error("required buffer handle missing")]
  MissingHandle,
  /// The buffer-object service could not satisfy an allocation; the
  /// session is unchanged.
  #[error("buffer object allocation failed")]
  AllocationFailed,
  /// Serialized data did not fit its command-buffer or header region.
  #[error("serialized data exceeds its region")]
  CommandBufferOverflow,
  /// The request cannot be encoded by this hardware, even after
  /// auto-correction.
  #[error("not supported by the hardware")]
  Unsupported,
}

/// One active encode context, owning its hardware-facing buffers through
/// the caller's [`BufferService`].
pub struct EncodeSession<S: BufferService> {
  pub(crate) inner: SessionInner<S>,
}

impl<S: BufferService> EncodeSession<S> {
  /// Opens the next picture, claiming a command buffer. May block until
  /// the job two generations behind retires.
  pub fn begin_picture(&mut self) -> Result<(), EncoderStatus> {
    self.inner.begin_picture()
  }

  /// Feeds one parameter buffer into the open picture.
  pub fn render(
    &mut self, kind: BufferKind, blob: &[u8],
  ) -> Result<(), EncoderStatus> {
    self.inner.render(kind, blob)
  }

  /// Closes the open picture and flushes its command stream to the
  /// hardware.
  pub fn end_picture(&mut self) -> Result<(), EncoderStatus> {
    self.inner.end_picture()
  }

  /// Records the completion handle for the job submitted by the last
  /// `end_picture`.
  pub fn attach_completion(&mut self, fence: Box<dyn CompletionFence>) {
    self.inner.attach_completion(fence)
  }

  /// Feeds back the true coded size of a retired picture, correcting
  /// the budget-based estimate `end_picture` applied for that frame.
  pub fn report_coded_size(&mut self, frame_index: u64, coded_bits: i64) {
    self.inner.report_coded_size(frame_index, coded_bits)
  }

  /// Emits the closing stream headers (H.264 end-of-sequence and
  /// end-of-stream).
  pub fn finish(&mut self) -> Result<(), EncoderStatus> {
    self.inner.finish()
  }

  /// Pictures completed so far.
  pub fn frame_index(&self) -> u64 {
    self.inner.frame_index()
  }

  /// Cores the last picture was spread over.
  pub fn active_core_count(&self) -> usize {
    self.inner.active_core_count()
  }

  /// Releases every owned buffer object, waiting out in-flight work,
  /// and returns the buffer service.
  pub fn close(self) -> S {
    self.inner.close()
  }

  #[cfg(test)]
  pub(crate) fn into_inner(self) -> SessionInner<S> {
    self.inner
  }
}
