//! Image and numeric helpers

pub mod image;
pub mod math;
