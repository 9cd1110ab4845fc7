//! Shared test utilities for the host core tests

#![allow(dead_code)]

pub mod mock_hardware;

pub use mock_hardware::*;
