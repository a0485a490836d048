//! Common test utilities for appkeep-backup
//!
//! This module provides shared test infrastructure including:
//! - A simulated device filesystem with one installed application
//! - Engine construction against that device
//! - Assertion helpers for per-instance outcomes

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
