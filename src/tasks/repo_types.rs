use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Closed status enum. Done-ness is tracked by the separate `completed`
/// flag, not by the status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Status::Active),
            "inactive" => Ok(Status::Inactive),
            other => Err(format!("invalid status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

/// Task record. `user_id` is set at creation and never updated; every read
/// and write is checked against the caller's identity.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub due_date: OffsetDateTime,
    pub status: Status,
    pub completed: bool,
    pub priority: Priority,
    pub tags: Vec<String>,
    /// Stored attachment filename, served under /uploads.
    pub file: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_lowercase_values() {
        assert_eq!("high".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("inactive".parse::<Status>(), Ok(Status::Inactive));
        assert!("urgent".parse::<Priority>().is_err());
        // legacy UI strings are not valid statuses
        assert!("completed".parse::<Status>().is_err());
        assert!("pending".parse::<Status>().is_err());
    }
}
