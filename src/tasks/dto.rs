use serde::{Deserialize, Serialize};

use crate::tasks::repo_types::{Priority, Status, Task};

/// Query string of the task listing.
#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub completed: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListResponse {
    pub length: usize,
    pub total_tasks: i64,
    pub total_pages: i64,
    pub current_page: i64,
    pub tasks: Vec<Task>,
}
