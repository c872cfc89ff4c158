//! Fuzz tests module
//!
//! Property-based testing using proptest to find edge cases:
//! - Wire message fuzzing
//! - Delivery buffer fuzzing

pub mod buffer_fuzz;
