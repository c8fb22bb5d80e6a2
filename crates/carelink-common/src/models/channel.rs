//! Channel model: the chat conversation owned by one caregiving group.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::member::MemberResponse;
use super::message::MessageResponse;

/// The user who created the caregiving group (usually the device wearer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorInfo {
    pub user_idx: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_profile: Option<String>,
    #[serde(default)]
    pub device_idx: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tel: Option<String>,
    #[serde(default)]
    pub date_reg: Option<DateTime<Utc>>,
}

/// One entry of `init.channel.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub channel_idx: String,
    pub channel_token: String,
    pub group_idx: String,
    #[serde(default)]
    pub emergency_target_user_idx: Option<String>,
    #[serde(default)]
    pub creator_info: Option<CreatorInfo>,
}

/// Payload of `create.channel.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelResponse {
    pub message_channel_idx: String,
    pub channel_token: String,
    pub group_idx: String,
    #[serde(default)]
    pub creator_idx: Option<String>,
    #[serde(default)]
    pub creator_info: Option<CreatorInfo>,
    #[serde(default)]
    pub date_reg: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_mod: Option<DateTime<Utc>>,
}

/// Payload of `enter.channel.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterChannelResponse {
    pub user_idx: String,
    pub channel_idx: String,
    pub group_idx: String,
    pub channel_token: String,
    #[serde(default)]
    pub channel_date_reg: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel_date_mod: Option<DateTime<Utc>>,
    #[serde(default)]
    pub emergency_target_user_idx: Option<String>,
    #[serde(default)]
    pub message_list: Vec<MessageResponse>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub user_list: Vec<MemberResponse>,
    #[serde(default)]
    pub creator_info: Option<CreatorInfo>,
}

/// Channel snapshot returned by the REST collaborator: roster, newest page of
/// messages (newest first), and the total message count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    #[serde(default)]
    pub message_list: Vec<MessageResponse>,
    #[serde(default)]
    pub user_list: Vec<MemberResponse>,
    #[serde(default)]
    pub total_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_without_creator() {
        let raw = r#"{"channelIdx":"c-1","channelToken":"tk","groupIdx":"g-1","emergencyTargetUserIdx":null}"#;
        let summary: ChannelSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.group_idx, "g-1");
        assert!(summary.creator_info.is_none());
        assert!(summary.emergency_target_user_idx.is_none());
    }

    #[test]
    fn test_snapshot_tolerates_missing_lists() {
        let snapshot: ChannelSnapshot = serde_json::from_str(r#"{"totalCount":4}"#).unwrap();
        assert_eq!(snapshot.total_count, 4);
        assert!(snapshot.message_list.is_empty());
        assert!(snapshot.user_list.is_empty());
    }
}
