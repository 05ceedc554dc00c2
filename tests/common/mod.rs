// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for routing and chaos tests.
//!
//! This module provides:
//! - Config and row builders
//! - A change log that fails or stalls on demand
//! - A sink that records and can refuse batches

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_source;

pub use fixtures::*;
pub use mock_source::*;
