//! Core of the event record synchronization engine.
//!
//! Reconciles event/booking records between an external sales system ("System A")
//! and the internal operations system ("System B"). The crate holds the domain
//! model, the collaborator contracts and the reconciliation pipeline; concrete
//! storage and HTTP clients live in sibling crates.

pub mod config;
pub mod conflicts;
pub mod errors;
pub mod health;
pub mod ledger;
pub mod mapping;
pub mod records;
pub mod sync;

pub use errors::{Error, Result};
