//! Coordinator event bus.
//!
//! UI layers subscribe here instead of to the transport. Dispatch is
//! fire-and-forget: publishing with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

/// Notifications published by the coordinator and its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GroupEvent {
    LoadStart,
    LoadComplete,
    /// A channel finished its initial snapshot load.
    ChannelInitialized { channel_id: String },
    MessageReceived { channel_id: String },
    /// Derived fields (read counts, markers) changed.
    Update { channel_id: String },
    AddChannel { channel_id: String },
    LeaveChannel { channel_id: String },
    Kicked { channel_id: String, user_id: Option<String> },
    RemoveUser { channel_id: String, user_id: String },
    UserJoin { channel_id: String },
    UserQuit { channel_id: String },
    UserEnter { channel_id: String },
    ChangeGroup { group_id: Option<String> },
    /// A message could not be delivered; the UI marks it failed.
    SendFailed { temp_uuid: String },
    ServerError { message: String },
    /// The server revoked this session; the user must log in again.
    SessionTerminated,
    Disconnected,
    ReconnectFailed,
}

/// Cloneable handle to the broadcast channel behind [`GroupEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GroupEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: GroupEvent) {
        tracing::trace!(?event, "publish");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
