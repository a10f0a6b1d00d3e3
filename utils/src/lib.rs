// A set of helper structs for common operations
//
// Austin Shafer - 2024
pub mod timing;
#[macro_use]
pub mod logging;
pub mod arena;
pub mod fdwatch;
pub mod log;
pub mod region;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Helper to perform max on PartialOrd types
///
/// We are using PartialOrd so that opacity and offset values
/// can handle floating point types that do not support Ord
pub fn partial_max<T: PartialOrd>(a: T, b: T) -> T {
    if a >= b {
        return a;
    } else {
        return b;
    }
}

/// Helper to perform min on PartialOrd types
pub fn partial_min<T: PartialOrd>(a: T, b: T) -> T {
    if a <= b {
        return a;
    } else {
        return b;
    }
}

/// Clamp a value into [lo, hi]
pub fn partial_clamp<T: PartialOrd>(val: T, lo: T, hi: T) -> T {
    partial_min(partial_max(val, lo), hi)
}
