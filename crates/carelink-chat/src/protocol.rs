//! Event-stream protocol: frame format, event names, and typed payloads.
//!
//! This module is the only vocabulary shared between the transport and the
//! coordinator. Frames are JSON text objects `{"event": <name>, "data": <payload>}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use carelink_common::models::{
    ChannelSummary, CreateChannelResponse, EnterChannelResponse, MessageResponse, MessageType,
};
use carelink_common::session::{RegistrationState, UserRole};

use crate::error::{ChatError, Result};

/// Wire event names.
pub mod names {
    // Client → server
    pub const INIT_CHANNEL: &str = "init.channel";
    pub const CREATE_CHANNEL: &str = "create.channel";
    pub const ENTER_CHANNEL: &str = "enter.channel";
    pub const JOIN_CHANNEL: &str = "channel.join";
    pub const QUIT_CHANNEL: &str = "channel.quit";
    pub const REMOVE_USER: &str = "remove.user";
    pub const LEAVE_CHANNEL: &str = "leave.channel";
    pub const MESSAGE_SEND: &str = "message.send";
    pub const UPDATE_MESSAGE: &str = "message.update";
    pub const UPDATE_USER: &str = "user.update";

    // Server → client
    pub const INIT_DATA_COMPLETE: &str = "init.data.complete";
    pub const INIT_CHANNEL_COMPLETE: &str = "init.channel.complete";
    pub const CREATE_CHANNEL_COMPLETE: &str = "create.channel.complete";
    pub const ENTER_CHANNEL_COMPLETE: &str = "enter.channel.complete";
    pub const USER_JOIN: &str = "user.join";
    pub const QUIT_CHANNEL_COMPLETE: &str = "channel.quit.complete";
    pub const USER_DISCONNECTED: &str = "user.disconnected";
    pub const USER_LIST: &str = "user.list";
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const DELETE_USER: &str = "delete.user";
    pub const LEAVE_CHANNEL_COMPLETE: &str = "leave.channel.complete";
    pub const LEAVE_CHANNEL_BY_OTHER: &str = "leave.channel.by.other";
    pub const ERROR_RECEIVED: &str = "error.received";
}

/// Field merged into every outbound payload once the server issued it.
pub const COMMON_TOKEN_FIELD: &str = "commonToken";

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Client → server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundEvent {
    InitChannel,
    CreateChannel,
    EnterChannel,
    JoinChannel,
    QuitChannel,
    RemoveUser,
    LeaveChannel,
    SendMessage,
    UpdateMessage,
    UpdateUser,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitChannel => names::INIT_CHANNEL,
            Self::CreateChannel => names::CREATE_CHANNEL,
            Self::EnterChannel => names::ENTER_CHANNEL,
            Self::JoinChannel => names::JOIN_CHANNEL,
            Self::QuitChannel => names::QUIT_CHANNEL,
            Self::RemoveUser => names::REMOVE_USER,
            Self::LeaveChannel => names::LEAVE_CHANNEL,
            Self::SendMessage => names::MESSAGE_SEND,
            Self::UpdateMessage => names::UPDATE_MESSAGE,
            Self::UpdateUser => names::UPDATE_USER,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChannelRequest {
    pub user_idx: String,
    pub state_reg: RegistrationState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub user_idx: String,
    pub message_channel_idx: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterChannelRequest {
    pub user_idx: String,
    pub message_channel_idx: String,
    pub group_idx: String,
}

/// Join/quit of the chat room view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
    pub user_idx: String,
    pub user_type: UserRole,
    pub channel_idx: String,
    pub channel_token: String,
}

/// Remove another member, or leave the group yourself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    pub group_idx: String,
    pub target_user_idx: String,
    pub channel_idx: String,
    pub channel_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessageRequest {
    pub message_body: String,
    pub message_type: MessageType,
    pub channel_token: String,
    pub temp_uuid: String,
}

/// Announces an already uploaded file message by its server sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMessageRequest {
    pub message_seq: u64,
    pub message_type: MessageType,
    pub temp_uuid: String,
    pub channel_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSyncRequest {
    pub channel_idx: String,
    pub channel_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUpdateRequest {
    pub channel_token: String,
    pub last_access_date: DateTime<Utc>,
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Roster movement in one channel (`user.join`, `channel.quit.complete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterChange {
    pub message_channel_idx: String,
    #[serde(default)]
    pub user_idx: Option<String>,
    /// Ids of the members currently online in the channel
    #[serde(default)]
    pub user_list: Vec<String>,
    pub access_date: DateTime<Utc>,
    #[serde(default)]
    pub message_list: Vec<MessageResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDisconnected {
    pub user_idx: String,
    #[serde(default)]
    pub channel_idx: Option<String>,
    #[serde(default)]
    pub last_access_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    pub message_info: Vec<MessageResponse>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub online_user_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    #[serde(default)]
    pub message_info: Vec<MessageResponse>,
    #[serde(default)]
    pub total_count: u64,
    pub channel_idx: String,
}

/// `user.update` is the one server event with snake_case fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccessUpdate {
    pub user_idx: String,
    pub last_access_date: DateTime<Utc>,
    pub message_channel_idx: String,
}

/// Removal, leave, or kick of a member from a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub channel_idx: String,
    pub group_idx: String,
    /// Absent on an unscoped kick, which targets the receiver
    #[serde(default)]
    pub user_idx: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedUser {
    pub user_idx: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitDataComplete {
    #[serde(default)]
    common_token: Option<String>,
}

/// Typed catalog of everything the transport can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Gave up after the configured number of reconnect attempts.
    ReconnectFailed { attempts: u32 },
    InitChannelComplete(Vec<ChannelSummary>),
    CreateChannelComplete(CreateChannelResponse),
    EnterChannelComplete(EnterChannelResponse),
    /// The local user joined a chat room view.
    JoinChannelComplete(RosterChange),
    /// The local user quit a chat room view.
    QuitChannelComplete(RosterChange),
    UserJoin(RosterChange),
    UserQuit(RosterChange),
    UserDisconnected(UserDisconnected),
    /// Online user ids of the channel currently open.
    RosterSnapshot(Vec<String>),
    MessageReceived(MessageBatch),
    MessageUpdated(MessageUpdate),
    UserUpdated(UserAccessUpdate),
    RemoveUser(MembershipChange),
    DeleteUser(DeletedUser),
    LeaveChannelComplete(MembershipChange),
    LeaveByOther(MembershipChange),
    ErrorReceived(String),
}

/// Discriminant of [`TransportEvent`], used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ReconnectFailed,
    InitChannelComplete,
    CreateChannelComplete,
    EnterChannelComplete,
    JoinChannelComplete,
    QuitChannelComplete,
    UserJoin,
    UserQuit,
    UserDisconnected,
    RosterSnapshot,
    MessageReceived,
    MessageUpdated,
    UserUpdated,
    RemoveUser,
    DeleteUser,
    LeaveChannelComplete,
    LeaveByOther,
    ErrorReceived,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            Self::InitChannelComplete(_) => EventKind::InitChannelComplete,
            Self::CreateChannelComplete(_) => EventKind::CreateChannelComplete,
            Self::EnterChannelComplete(_) => EventKind::EnterChannelComplete,
            Self::JoinChannelComplete(_) => EventKind::JoinChannelComplete,
            Self::QuitChannelComplete(_) => EventKind::QuitChannelComplete,
            Self::UserJoin(_) => EventKind::UserJoin,
            Self::UserQuit(_) => EventKind::UserQuit,
            Self::UserDisconnected(_) => EventKind::UserDisconnected,
            Self::RosterSnapshot(_) => EventKind::RosterSnapshot,
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::MessageUpdated(_) => EventKind::MessageUpdated,
            Self::UserUpdated(_) => EventKind::UserUpdated,
            Self::RemoveUser(_) => EventKind::RemoveUser,
            Self::DeleteUser(_) => EventKind::DeleteUser,
            Self::LeaveChannelComplete(_) => EventKind::LeaveChannelComplete,
            Self::LeaveByOther(_) => EventKind::LeaveByOther,
            Self::ErrorReceived(_) => EventKind::ErrorReceived,
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(TransportEvent),
    /// The server issued (or revoked) the common session token.
    SessionToken(Option<String>),
    /// Unknown event, or one the local user should not see.
    Ignored,
}

fn payload<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_value(frame.data.clone())
        .map_err(|e| ChatError::protocol(frame.event.clone(), e.to_string()))
}

/// Decode a server frame for the session user `local_user_id`.
pub fn decode(frame: &Frame, local_user_id: &str) -> Result<Inbound> {
    let is_me = |id: Option<&str>| id == Some(local_user_id);

    let event = match frame.event.as_str() {
        names::INIT_DATA_COMPLETE => {
            let init: InitDataComplete = payload(frame)?;
            return Ok(Inbound::SessionToken(init.common_token));
        }
        names::INIT_CHANNEL_COMPLETE => {
            let list = if frame.data.is_null() {
                Vec::new()
            } else {
                payload(frame)?
            };
            TransportEvent::InitChannelComplete(list)
        }
        names::CREATE_CHANNEL_COMPLETE => TransportEvent::CreateChannelComplete(payload(frame)?),
        names::ENTER_CHANNEL_COMPLETE => TransportEvent::EnterChannelComplete(payload(frame)?),
        names::USER_JOIN => {
            let change: RosterChange = payload(frame)?;
            if is_me(change.user_idx.as_deref()) {
                TransportEvent::JoinChannelComplete(change)
            } else {
                TransportEvent::UserJoin(change)
            }
        }
        names::QUIT_CHANNEL_COMPLETE => {
            let change: RosterChange = payload(frame)?;
            if is_me(change.user_idx.as_deref()) {
                TransportEvent::QuitChannelComplete(change)
            } else {
                TransportEvent::UserQuit(change)
            }
        }
        names::USER_DISCONNECTED => {
            let dt: UserDisconnected = payload(frame)?;
            if is_me(Some(dt.user_idx.as_str())) {
                return Ok(Inbound::Ignored);
            }
            TransportEvent::UserDisconnected(dt)
        }
        names::USER_LIST => {
            let ids = match &frame.data {
                Value::Null => Vec::new(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(id) => Some(id.clone()),
                        Value::Object(entry) => entry
                            .get("userIdx")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        _ => None,
                    })
                    .collect(),
                _ => return Err(ChatError::protocol(names::USER_LIST, "expected a list")),
            };
            TransportEvent::RosterSnapshot(ids)
        }
        names::MESSAGE_RECEIVED => TransportEvent::MessageReceived(payload(frame)?),
        names::UPDATE_MESSAGE => TransportEvent::MessageUpdated(payload(frame)?),
        names::UPDATE_USER => TransportEvent::UserUpdated(payload(frame)?),
        names::REMOVE_USER => TransportEvent::RemoveUser(payload(frame)?),
        names::DELETE_USER => TransportEvent::DeleteUser(payload(frame)?),
        names::LEAVE_CHANNEL_COMPLETE => TransportEvent::LeaveChannelComplete(payload(frame)?),
        names::LEAVE_CHANNEL_BY_OTHER => TransportEvent::LeaveByOther(payload(frame)?),
        names::ERROR_RECEIVED => {
            let message = match &frame.data {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            TransportEvent::ErrorReceived(message)
        }
        _ => return Ok(Inbound::Ignored),
    };
    Ok(Inbound::Event(event))
}

/// Merge the common session token into an outbound payload.
pub fn with_common_token(payload: Value, token: Option<&str>) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_owned(), other);
            map
        }
    };
    if let Some(token) = token {
        object.insert(COMMON_TOKEN_FIELD.to_owned(), Value::String(token.to_owned()));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: Value) -> Frame {
        Frame::new(event, data)
    }

    #[test]
    fn test_user_join_split_by_local_user() {
        let data = json!({
            "messageChannelIdx": "c-1",
            "userIdx": "me",
            "userList": ["me", "u-2"],
            "accessDate": "2026-03-01T10:00:00Z"
        });
        let mine = decode(&frame(names::USER_JOIN, data.clone()), "me").unwrap();
        assert!(matches!(mine, Inbound::Event(TransportEvent::JoinChannelComplete(_))));

        let other = decode(&frame(names::USER_JOIN, data), "someone-else").unwrap();
        assert!(matches!(other, Inbound::Event(TransportEvent::UserJoin(_))));
    }

    #[test]
    fn test_quit_split_and_self_disconnect_dropped() {
        let quit = json!({
            "messageChannelIdx": "c-1",
            "userIdx": "u-2",
            "userList": [],
            "accessDate": "2026-03-01T10:00:00Z"
        });
        let decoded = decode(&frame(names::QUIT_CHANNEL_COMPLETE, quit), "me").unwrap();
        assert!(matches!(decoded, Inbound::Event(TransportEvent::UserQuit(_))));

        let gone = decode(&frame(names::USER_DISCONNECTED, json!({ "userIdx": "me" })), "me").unwrap();
        assert_eq!(gone, Inbound::Ignored);
    }

    #[test]
    fn test_session_token_and_unknown_events() {
        let token = decode(
            &frame(names::INIT_DATA_COMPLETE, json!({ "commonToken": "ct-1" })),
            "me",
        )
        .unwrap();
        assert_eq!(token, Inbound::SessionToken(Some("ct-1".into())));

        let unknown = decode(&frame("typing.start", json!({})), "me").unwrap();
        assert_eq!(unknown, Inbound::Ignored);
    }

    #[test]
    fn test_roster_snapshot_accepts_ids_and_entries() {
        let decoded = decode(
            &frame(names::USER_LIST, json!(["u-1", { "userIdx": "u-2" }, 7])),
            "me",
        )
        .unwrap();
        assert_eq!(
            decoded,
            Inbound::Event(TransportEvent::RosterSnapshot(vec!["u-1".into(), "u-2".into()]))
        );
    }

    #[test]
    fn test_error_payload_as_plain_string() {
        let decoded = decode(&frame(names::ERROR_RECEIVED, json!("CHANNEL_CLOSED")), "me").unwrap();
        assert_eq!(
            decoded,
            Inbound::Event(TransportEvent::ErrorReceived("CHANNEL_CLOSED".into()))
        );
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let err = decode(&frame(names::MESSAGE_RECEIVED, json!({ "bogus": 1 })), "me").unwrap_err();
        assert!(matches!(err, ChatError::Protocol { ref event, .. } if event == names::MESSAGE_RECEIVED));
    }

    #[test]
    fn test_common_token_merge() {
        let merged = with_common_token(json!({ "channelIdx": "c-1" }), Some("ct"));
        assert_eq!(merged, json!({ "channelIdx": "c-1", "commonToken": "ct" }));

        let untouched = with_common_token(json!({ "channelIdx": "c-1" }), None);
        assert_eq!(untouched, json!({ "channelIdx": "c-1" }));
    }
}
