//! # carelink-chat
//!
//! Realtime group chat and presence for caregiving groups: one event-stream
//! connection per session, a coordinator that keeps every group's channel in
//! sync, and a typed event bus for UI layers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use carelink_chat::{GroupEvent, InstanceRegistry};
//! use carelink_common::session::{SessionUser, UserRole};
//!
//! #[tokio::main]
//! async fn main() -> carelink_chat::Result<()> {
//!     let config = carelink_common::config::init()?;
//!     let mut registry = InstanceRegistry::open(config.clone())?;
//!
//!     let user = SessionUser::new("u-1", "alice", "Alice", UserRole::User);
//!     let session = registry.get_or_create(user).await?;
//!     let mut events = session.subscribe();
//!
//!     while let Ok(event) = events.recv().await {
//!         if event == GroupEvent::SessionTerminated {
//!             break;
//!         }
//!     }
//!     registry.release().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChatMessage, Member};
pub use coordinator::{GroupCoordinator, MessageBody, OutgoingMessage, new_temp_uuid};
pub use error::{ChatError, Result};
pub use events::{EventBus, GroupEvent};
pub use registry::{ChatSession, InstanceRegistry};
pub use rest::{ChatApi, RestClient};
pub use transport::{ChatTransport, TransportClient};
