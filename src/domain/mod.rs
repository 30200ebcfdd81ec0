//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - run configuration (`FitConfig`, `FitMode`, `Prior`)
//! - the output record (`ZFitRecord`) and its parts

pub mod types;

pub use types::*;
