//! Message model: wire payloads and the message type taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::UserRole;

/// Message type. Emergency variants are raised by the wearable device or a
/// caregiver and require acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Video,
    Image,
    Emergency,
    EmergencyAlarm,
    EmergencyVideo,
    EmergencyImage,
    Error,
    /// System notice: a member entered the group
    Enter,
    /// System notice: a member left the group
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Video => "VIDEO",
            Self::Image => "IMAGE",
            Self::Emergency => "EMERGENCY",
            Self::EmergencyAlarm => "EMERGENCY_ALARM",
            Self::EmergencyVideo => "EMERGENCY_VIDEO",
            Self::EmergencyImage => "EMERGENCY_IMAGE",
            Self::Error => "ERROR",
            Self::Enter => "ENTER",
            Self::Leave => "LEAVE",
        }
    }

    /// Alarm/emergency alert classes.
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            Self::Emergency | Self::EmergencyAlarm | Self::EmergencyVideo | Self::EmergencyImage
        )
    }

    /// Enter/leave notices generated by the server.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Enter | Self::Leave)
    }

    /// Types shown as a conversation bubble.
    pub fn is_displayable(&self) -> bool {
        matches!(self, Self::Text | Self::Image | Self::Video) || self.is_emergency()
    }

    /// Types whose body is a file and must be uploaded before sending.
    pub fn is_file(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::EmergencyImage | Self::EmergencyVideo
        )
    }
}

/// A message as delivered by the server (`message.received`, snapshots, pages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message_seq: u64,
    #[serde(default)]
    pub message_channel_idx: String,
    #[serde(default)]
    pub message_body: String,
    pub message_type: MessageType,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub date_reg: DateTime<Utc>,
    pub date_mod: DateTime<Utc>,
    pub user_idx: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: String,
    /// Correlation id echoed back for messages this client sent
    #[serde(default)]
    pub temp_uuid: Option<String>,
    #[serde(default)]
    pub user_type: Option<UserRole>,
    #[serde(default)]
    pub read_count: Option<u32>,
    #[serde(default)]
    pub file_info: Option<String>,
    #[serde(default)]
    pub user_profile: Option<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_classes() {
        assert!(MessageType::EmergencyAlarm.is_emergency());
        assert!(MessageType::EmergencyImage.is_file());
        assert!(MessageType::Video.is_displayable());
        assert!(!MessageType::Enter.is_displayable());
        assert!(MessageType::Leave.is_system());
        assert!(!MessageType::Error.is_displayable());
        assert!(!MessageType::Text.is_file());
    }

    #[test]
    fn test_message_response_defaults() {
        let raw = r#"{
            "messageSeq": 12,
            "messageType": "EMERGENCY_ALARM",
            "dateReg": "2026-03-01T09:30:00Z",
            "dateMod": "2026-03-01T09:30:00Z",
            "userIdx": "u-2"
        }"#;
        let msg: MessageResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::EmergencyAlarm);
        assert!(msg.is_active);
        assert!(msg.temp_uuid.is_none());
        assert_eq!(msg.message_body, "");
    }
}
