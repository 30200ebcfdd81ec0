//! Exposure units: one stacked 2D spectrum per grism (or grism + PA).

pub mod unit;

pub use unit::*;
