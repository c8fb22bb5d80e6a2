//! The authenticated session user and role types.
//!
//! Every chat component reads the local user's identity from here instead of a
//! global; the session is constructed once at login and shared by reference.

use serde::{Deserialize, Serialize};

use crate::error::CareLinkError;

/// Account role as reported by the authentication service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// Family member or caregiver using the companion app
    User,
    /// The wearer of the device
    UserDevice,
    /// Care-facility manager overseeing many groups
    Manager,
    /// Back-office administrator (no chat access)
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::UserDevice => "USER_DEVICE",
            Self::Manager => "MANAGER",
            Self::Admin => "ADMIN",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = CareLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "USER_DEVICE" => Ok(Self::UserDevice),
            "MANAGER" => Ok(Self::Manager),
            "ADMIN" => Ok(Self::Admin),
            other => Err(CareLinkError::UnknownRole { role: other.to_owned() }),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration-state filter sent with the channel init request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    Request,
    Resolve,
    Reject,
}

/// Identity of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    /// Internal user index, the id used on the wire (`userIdx`)
    #[serde(rename = "userIdx")]
    pub user_id: String,
    /// Human-facing login id (`userId`)
    #[serde(rename = "userId")]
    pub login_id: String,
    pub username: String,
    #[serde(rename = "userType")]
    pub role: UserRole,
    /// Bearer token for the REST collaborator, when logged in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl SessionUser {
    pub fn new(
        user_id: impl Into<String>,
        login_id: impl Into<String>,
        username: impl Into<String>,
        role: UserRole,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            login_id: login_id.into(),
            username: username.into(),
            role,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Whether `user_id` refers to this session's user.
    pub fn is_me(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_wire_names() {
        assert_eq!("USER_DEVICE".parse::<UserRole>().unwrap(), UserRole::UserDevice);
        assert_eq!(UserRole::Manager.to_string(), "MANAGER");
        assert!(matches!(
            "GUEST".parse::<UserRole>(),
            Err(CareLinkError::UnknownRole { .. })
        ));
    }

    #[test]
    fn test_session_user_deserializes_stored_login() {
        let raw = r#"{"userIdx":"u-1","userId":"alice","username":"Alice","userType":"USER"}"#;
        let user: SessionUser = serde_json::from_str(raw).unwrap();
        assert_eq!(user.user_id, "u-1");
        assert_eq!(user.role, UserRole::User);
        assert!(user.access_token.is_none());
        assert!(user.is_me("u-1"));
    }
}
