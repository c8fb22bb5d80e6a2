//! Member model: one user's membership in a chat channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::UserRole;

/// A roster entry as returned by the channel snapshot and enter events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResponse {
    pub user_idx: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_type: Option<UserRole>,
    #[serde(default)]
    pub message_channel_idx: String,
    #[serde(default)]
    pub user_profile: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    pub last_access_date: DateTime<Utc>,
    #[serde(default)]
    pub channel_date_reg: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel_date_mod: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_idx: Option<String>,
}
