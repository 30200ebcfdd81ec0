//! `grism-zfit` library crate.
//!
//! The binary (`zfit`) is a thin wrapper around this library so that:
//!
//! - the fitting engine is testable without spawning processes
//! - modules are reusable from other front-ends

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod exposure;
pub mod fit;
pub mod io;
pub mod math;
pub mod report;
pub mod spectrum;
