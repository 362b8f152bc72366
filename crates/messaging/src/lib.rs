pub mod store;
pub mod unread;

pub use store::{MessageStore, resolve_private_key};
pub use unread::UnreadCounter;
