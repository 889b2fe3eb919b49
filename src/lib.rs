// Copyright (c) 2024-2026, The hwenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! hwenc is the host-side control path for a multi-core hardware video
//! encoder.
//!
//! It turns API-level picture and slice parameters into the three things
//! the hardware consumes:
//!
//! - a command stream dispatched across up to four parallel encode cores,
//!   scheduled so the master core always finishes a picture last,
//! - codec bitstream headers (H.264, MPEG-4, H.263) built bit-by-bit, with
//!   some fields left as tokens for the firmware to resolve at encode
//!   time,
//! - rate-control and bias parameters steering the hardware's in-loop bit
//!   allocation and mode decisions.
//!
//! The crate does not talk to a device itself: callers supply a
//! [`BufferService`](hwmem::BufferService) for buffer-object allocation
//! and upload, and submit the flushed command buffers through their own
//! transport.
//!
//! # Usage
//!
//! Build a [`Config`], open an [`EncodeSession`], then drive the
//! begin-picture / render / end-picture cycle once per frame. See the
//! [`api`] module for details.

pub mod api;
pub mod bias;
pub mod command;
pub mod header;
pub mod hwmem;
pub mod mbparams;
pub mod params;
pub mod rate;
mod util;

pub use crate::api::*;
pub use crate::params::BufferKind;
