//! Session model: one end-to-end autonomous browser run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Stopped,
    Crashed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session metadata shared with observers and carried into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub target_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl SessionInfo {
    pub fn new(target_url: impl Into<String>, task: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_url: target_url.into(),
            task,
            started_at: Utc::now(),
            status: SessionStatus::Running,
        }
    }
}
