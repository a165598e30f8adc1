use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Provisioning,
    Running,
    Finished,
    Cancel,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Cancel | JobState::Error)
    }

    // Terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Provisioning => 1,
            JobState::Running => 2,
            JobState::Finished | JobState::Cancel | JobState::Error => 3,
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Provisioning => write!(f, "provisioning"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
            JobState::Cancel => write!(f, "cancel"),
            JobState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub scenario: String,
    pub state: JobState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name, scenario, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        name: impl Into<String>,
        scenario: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            scenario: scenario.into(),
            state: JobState::Pending,
            error: None,
            created_at,
            updated_at: created_at,
        }
    }
}
