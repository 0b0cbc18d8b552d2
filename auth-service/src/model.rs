use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use common_auth::ROLE_ADMIN;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application-specific profile fields, kept beside the core record rather than in it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAttributes(pub serde_json::Map<String, serde_json::Value>);

impl UserAttributes {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub roles: BTreeSet<String>,
    pub enabled: bool,
    pub attributes: UserAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    /// Admins who can still sign in; last-admin protection counts these.
    pub fn is_active_admin(&self) -> bool {
        !self.is_deleted() && self.enabled && self.is_admin()
    }

    pub fn role_list(&self) -> Vec<String> {
        self.roles.iter().cloned().collect()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("roles", &self.roles)
            .field("enabled", &self.enabled)
            .field("deleted_at", &self.deleted_at)
            .finish()
    }
}

/// Outward view of a user; the password hash never leaves the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub roles: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub attributes: UserAttributes,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            roles: user.role_list(),
            enabled: user.enabled,
            created_at: user.created_at,
            updated_at: user.updated_at,
            deleted_at: user.deleted_at,
            attributes: user.attributes.clone(),
        }
    }
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self::from(&user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleAction {
    Add,
    Remove,
}

impl RoleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleAction::Add => "ADD",
            RoleAction::Remove => "REMOVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADD" => Some(RoleAction::Add),
            "REMOVE" => Some(RoleAction::Remove),
            _ => None,
        }
    }
}

/// Immutable audit record of a role mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangeEntry {
    pub id: Uuid,
    pub target_user_id: Uuid,
    pub acting_user_id: Uuid,
    pub role: String,
    pub action: RoleAction,
    pub timestamp: DateTime<Utc>,
}

/// Emails compare case-insensitively; the stored form is trimmed lower case.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn is_well_formed_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}
