//! Shared enumerations persisted in job records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
        }
    }
}

impl TryFrom<&str> for JobState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CollectEntity,
    Revalidate,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::CollectEntity => "collect_entity",
            JobType::Revalidate => "revalidate",
        }
    }
}

impl TryFrom<&str> for JobType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "collect_entity" => Ok(JobType::CollectEntity),
            "revalidate" => Ok(JobType::Revalidate),
            other => Err(format!("unknown job type `{other}`")),
        }
    }
}
