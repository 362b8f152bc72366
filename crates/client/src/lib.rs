//! Conversation sync for Huddle.
//!
//! [`ChatClient`] wires the hub connection to the message store, presence,
//! typing, and unread state, and is the only type a front end needs.

mod client;
pub mod compose;
mod dispatcher;
mod state;

pub use client::ChatClient;
pub use compose::{ComposeTracker, TypingSink};
