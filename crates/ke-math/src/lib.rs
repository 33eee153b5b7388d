//! Kalman estimation math utilities.

pub mod math;

pub use math::linalg::*;
pub use math::stats::*;
