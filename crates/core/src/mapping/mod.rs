//! Declarative field table and the pure record mapper.

mod mapping_model;
mod record_mapper;

pub use mapping_model::*;
pub use record_mapper::*;
