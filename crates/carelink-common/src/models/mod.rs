//! Wire models exchanged with the chat server and the REST collaborator.
//!
//! Field names follow the server's camelCase JSON; ids are opaque strings.

pub mod channel;
pub mod member;
pub mod message;

pub use channel::*;
pub use member::*;
pub use message::*;
