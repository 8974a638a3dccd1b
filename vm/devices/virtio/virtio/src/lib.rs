// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core virtio device infrastructure: split virtqueues and the device trait
//! transports drive.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

mod common;
pub mod queue;
pub mod spec;
#[cfg(any(test, feature = "test_helpers"))]
pub mod test_helpers;

pub use common::*;
