//! Process-wide synchronization configuration.

mod config_model;

pub use config_model::*;
