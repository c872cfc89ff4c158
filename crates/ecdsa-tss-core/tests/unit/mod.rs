//! Unit tests module
//!
//! This module contains unit tests for individual components:
//! - Party driver
//! - Network router

pub mod driver_test;
pub mod router_test;
