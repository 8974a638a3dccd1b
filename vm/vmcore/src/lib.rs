// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core definitions shared by device crates.

#![forbid(unsafe_code)]

pub mod interrupt;
