use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account owning one or more API keys. Emails compare case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,

    pub email: String,

    /// Opaque to the gateway; login/session handling is the admin layer's.
    #[serde(default)]
    pub password_hash: Option<String>,

    pub plan_id: String,

    #[serde(default)]
    pub status: UserStatus,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Suspended,
    Cancelled,
    Deleted,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}
