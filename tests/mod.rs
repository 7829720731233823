//! Test suite for ReliefSync
//!
//! This module organizes all tests

pub mod common;
pub mod property;
