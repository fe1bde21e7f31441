use serde::{Deserialize, Serialize};

/// Identity handed over by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub anonymous: bool,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            anonymous: false,
        }
    }

    pub fn anonymous(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            anonymous: true,
        }
    }
}

/// Member role on a shared canvas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SharedRole {
    Owner,
    Editor,
    Viewer,
}

impl SharedRole {
    /// Returns true when the role is allowed to modify canvas content.
    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCanvas {
    pub canvas_id: String,
    pub role: SharedRole,
}
