//! Shared building blocks for Huddle: the event bus that carries state-change
//! notifications to observers, configuration, the credential store seam, the
//! conversation data model, and the error types every other crate builds on.

pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod types;

pub use error::{HuddleError, Result};
