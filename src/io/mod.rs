//! Input/output helpers.
//!
//! - stack file of 2D spectra (`stack`)
//! - template library (`templates`)
//! - output record (`record`)
//! - shared JSON plumbing, prior and photometric catalog (`json`)

pub mod json;
pub mod record;
pub mod stack;
pub mod templates;

pub use json::*;
pub use record::*;
pub use stack::*;
pub use templates::*;
