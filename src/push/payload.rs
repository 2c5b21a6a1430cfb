//! Notification payloads rendered by the client's service worker.
//!
//! The JSON shape is a contract with the client: a `type` discriminant plus
//! `title`, `body`, `icon`, `badge`, and `taskId` for task-scoped kinds.

use serde::{Deserialize, Serialize};

use crate::scheduler::tasks::Task;

/// Display fields shared by every notification kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
}

/// Closed set of notifications the engine can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NotificationPayload {
    /// One hour before the due time.
    TaskHour {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(flatten)]
        content: NotificationContent,
    },
    /// At the due time.
    TaskDue {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(flatten)]
        content: NotificationContent,
    },
    /// The occurrence was missed and carried forward to today.
    TaskMissed {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(flatten)]
        content: NotificationContent,
    },
    /// Once-daily digest of what is due today.
    DailySummary {
        #[serde(flatten)]
        content: NotificationContent,
    },
    /// Manual delivery check.
    Test {
        #[serde(flatten)]
        content: NotificationContent,
    },
}

/// Icon and badge paths stamped onto every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadStyle {
    pub icon: String,
    pub badge: String,
}

impl Default for PayloadStyle {
    fn default() -> Self {
        Self {
            icon: "/icons/logo.svg".to_owned(),
            badge: "/icons/logo.svg".to_owned(),
        }
    }
}

impl PayloadStyle {
    fn content(&self, title: String, body: String) -> NotificationContent {
        NotificationContent {
            title,
            body,
            icon: self.icon.clone(),
            badge: self.badge.clone(),
        }
    }

    pub fn hour_before(&self, task: &Task) -> NotificationPayload {
        NotificationPayload::TaskHour {
            task_id: task.id.clone(),
            content: self.content(
                format!("1 hour left: {}", task.title),
                task.body_with_notes(&format!("~1 hour until due ({})", task.remind_at)),
            ),
        }
    }

    pub fn due(&self, task: &Task) -> NotificationPayload {
        NotificationPayload::TaskDue {
            task_id: task.id.clone(),
            content: self.content(
                task.title.clone(),
                task.body_with_notes(&task.recurrence.describe()),
            ),
        }
    }

    pub fn missed(&self, task: &Task) -> NotificationPayload {
        NotificationPayload::TaskMissed {
            task_id: task.id.clone(),
            content: self.content(
                format!("Missed: {}", task.title),
                task.body_with_notes(&format!(
                    "Missed. New deadline: today at {}",
                    task.remind_at
                )),
            ),
        }
    }

    pub fn daily_summary(&self, due_today: usize) -> NotificationPayload {
        let body = if due_today == 1 {
            "You have 1 task due today".to_owned()
        } else {
            format!("You have {due_today} tasks due today")
        };
        NotificationPayload::DailySummary {
            content: self.content("Today's tasks".to_owned(), body),
        }
    }

    pub fn test(&self) -> NotificationPayload {
        NotificationPayload::Test {
            content: self.content(
                "Test notification".to_owned(),
                "Push notifications are working".to_owned(),
            ),
        }
    }
}

impl NotificationPayload {
    /// Wire discriminant, as serialized in `type`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskHour { .. } => "task-hour",
            Self::TaskDue { .. } => "task-due",
            Self::TaskMissed { .. } => "task-missed",
            Self::DailySummary { .. } => "daily-summary",
            Self::Test { .. } => "test",
        }
    }

    /// Task the notification is about, for task-scoped kinds.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskHour { task_id, .. }
            | Self::TaskDue { task_id, .. }
            | Self::TaskMissed { task_id, .. } => Some(task_id),
            Self::DailySummary { .. } | Self::Test { .. } => None,
        }
    }

    #[must_use]
    pub fn content(&self) -> &NotificationContent {
        match self {
            Self::TaskHour { content, .. }
            | Self::TaskDue { content, .. }
            | Self::TaskMissed { content, .. }
            | Self::DailySummary { content }
            | Self::Test { content } => content,
        }
    }

    /// Serialized JSON bytes sent as the encrypted push body.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
