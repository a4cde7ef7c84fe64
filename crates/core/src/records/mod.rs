//! Record shapes of both systems and the collaborator client contracts.

mod records_model;
mod records_traits;

pub use records_model::*;
pub use records_traits::*;
