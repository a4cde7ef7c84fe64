//! HTTP clients for the two systems kept in sync.
//!
//! [`SystemAClient`] talks to the CRM events API and [`SystemBClient`] to the
//! operations records API. Both implement the collaborator traits from
//! `eventsync-core` and translate HTTP failures into the engine's error taxonomy,
//! so transient failures surface as `Error::Connection` and get retried.

mod http;

pub mod error;
pub mod system_a;
pub mod system_b;
pub mod types;

pub use error::{ApiRetryClass, ConnectError, Result};
pub use system_a::SystemAClient;
pub use system_b::SystemBClient;
