//! Role policies: the few behaviors that differ between account roles.

use carelink_common::error::{CareLinkError, CareLinkResult};
use carelink_common::models::MessageType;
use carelink_common::session::{RegistrationState, UserRole};

use crate::protocol::EventKind;

/// Where an outgoing message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// The channel open in the chat view
    CurrentChannel,
    /// The group the local user created (the wearer's own group)
    OwnGroup,
    /// The role cannot send this type
    Unroutable,
}

pub trait RolePolicy: Send + Sync {
    fn role(&self) -> UserRole;

    /// Registration-state filter sent with `init.channel`.
    fn init_filter(&self) -> RegistrationState {
        RegistrationState::Resolve
    }

    fn route_target(&self, message_type: MessageType) -> RouteTarget;

    /// Whether the coordinator handles this transport event for the role.
    fn subscribes_to(&self, _kind: EventKind) -> bool {
        true
    }
}

/// Family members, caregivers and device wearers.
#[derive(Debug, Clone, Copy)]
pub struct UserPolicy {
    role: UserRole,
}

impl RolePolicy for UserPolicy {
    fn role(&self) -> UserRole {
        self.role
    }

    fn route_target(&self, message_type: MessageType) -> RouteTarget {
        match message_type {
            MessageType::EmergencyAlarm => RouteTarget::OwnGroup,
            _ => RouteTarget::CurrentChannel,
        }
    }

    fn subscribes_to(&self, kind: EventKind) -> bool {
        kind != EventKind::RosterSnapshot
    }
}

/// Care-facility managers. They have no device, so no alarms.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerPolicy;

impl RolePolicy for ManagerPolicy {
    fn role(&self) -> UserRole {
        UserRole::Manager
    }

    fn route_target(&self, message_type: MessageType) -> RouteTarget {
        match message_type {
            MessageType::EmergencyAlarm => RouteTarget::Unroutable,
            _ => RouteTarget::CurrentChannel,
        }
    }
}

/// Select the policy for an authenticated role.
pub fn policy_for(role: UserRole) -> CareLinkResult<Box<dyn RolePolicy>> {
    match role {
        UserRole::User | UserRole::UserDevice => Ok(Box::new(UserPolicy { role })),
        UserRole::Manager => Ok(Box::new(ManagerPolicy)),
        other => Err(CareLinkError::UnknownRole {
            role: other.to_string(),
        }),
    }
}
