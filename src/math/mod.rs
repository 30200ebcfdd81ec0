//! Numerical building blocks: resampling, grids, least squares and NNLS.

pub mod grid;
pub mod interp;
pub mod nnls;
pub mod ols;

pub use grid::*;
pub use interp::*;
pub use nnls::*;
pub use ols::*;
