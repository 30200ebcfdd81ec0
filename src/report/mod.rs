//! Reporting: output record assembly and formatted terminal output.

pub mod assemble;
pub mod format;

pub use assemble::*;
pub use format::*;
