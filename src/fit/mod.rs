//! Fitting engine.
//!
//! Responsibilities:
//!
//! - assemble exposures (and optional photometry) into one weighted system
//! - solve for non-negative template coefficients at a fixed redshift
//! - scan the redshift grid in parallel and refine around the minimum

pub mod joint;
pub mod photometry;
pub mod scale;
pub mod zgrid;

pub use joint::*;
pub use photometry::*;
pub use scale::*;
pub use zgrid::*;
