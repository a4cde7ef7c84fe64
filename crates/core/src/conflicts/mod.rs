//! Field-level conflict detection and resolution.

mod conflict_detector;
mod conflict_resolver;
mod conflicts_model;

pub use conflict_detector::*;
pub use conflict_resolver::*;
pub use conflicts_model::*;
