//! Spectral modeling: the dispersion model, templates and IGM transmission.

pub mod dispersion;
pub mod igm;
pub mod template;

pub use dispersion::*;
pub use igm::*;
pub use template::*;
