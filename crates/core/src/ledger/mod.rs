//! Operation ledger: durable history of sync attempts, conflicts and record links.

mod ledger_model;
mod ledger_traits;

pub use ledger_model::*;
pub use ledger_traits::*;
