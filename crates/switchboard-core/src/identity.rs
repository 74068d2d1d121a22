//! Authenticated principal attached to a connection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of an authenticated principal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full administrative access.
    Admin,
    /// Team lead / supervisor.
    Manager,
    /// Front-line agent handling conversations.
    #[default]
    Agent,
}

impl Role {
    /// Parse a role claim (case-insensitive). Unknown roles yield `None`.
    pub fn from_claim(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "manager" | "supervisor" => Some(Self::Manager),
            "agent" | "user" => Some(Self::Agent),
            _ => None,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated principal.
///
/// Produced by credential validation and attached to a connection exactly
/// once; it is never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable principal id (the credential subject). Sessions are keyed by it.
    pub user_id: String,
    /// Contact email; falls back to `user_id` when the credential has none.
    pub email: String,
    /// Role used for stats grouping and authorization decisions.
    pub role: Role,
    /// When the presented credential stops being valid.
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    /// Build an identity.
    pub fn new(
        user_id: impl Into<String>,
        email: Option<String>,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        let email = email
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| user_id.clone());
        Self {
            user_id,
            email,
            role,
            expires_at,
        }
    }

    /// Whether two identities name the same principal.
    pub fn same_principal(&self, other: &Identity) -> bool {
        self.user_id == other.user_id
    }
}
