//! Read-only health and status reporting.

mod health_model;
mod health_service;

pub use health_model::*;
pub use health_service::*;
