// Member & audit log Domain Model

use serde::{Deserialize, Serialize};

/// Username (primary key of a member)
pub type Username = String;

/// Registered member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub username: Username,
    pub joined_at: i64, // epoch ms
}

impl Member {
    pub fn new(username: impl Into<String>, joined_at: i64) -> crate::domain::error::Result<Self> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(crate::domain::DomainError::ValidationError(
                "username must not be empty".to_string(),
            ));
        }
        Ok(Self {
            username,
            joined_at,
        })
    }
}

/// Audit log entry written alongside a member join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub written_at: i64, // epoch ms
}

impl LogEntry {
    pub fn new(message: impl Into<String>, written_at: i64) -> Self {
        Self {
            message: message.into(),
            written_at,
        }
    }
}
