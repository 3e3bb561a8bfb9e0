use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionId, ActionStatus};

/// Synthetic message attached to a confirmed cancellation entry.
pub const CANCELLATION_FINISHED_MESSAGE: &str =
    "Cancellation completion is finished successfully.";

/// Status update reported for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusUpdate {
    /// Reported status.
    pub status: ActionStatus,
    /// Ordered free-text messages.
    pub messages: Vec<String>,
    /// Timestamp of the report.
    pub occurred_at: DateTime<Utc>,
}

impl ActionStatusUpdate {
    /// Creates an update without messages.
    #[must_use]
    pub fn new(status: ActionStatus, occurred_at: DateTime<Utc>) -> Self {
        Self {
            status,
            messages: Vec::new(),
            occurred_at,
        }
    }

    /// Appends one message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// One append-only entry of an action's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusEntry {
    id: i64,
    action_id: ActionId,
    status: ActionStatus,
    occurred_at: DateTime<Utc>,
    messages: Vec<String>,
}

impl ActionStatusEntry {
    /// Creates a stored history entry.
    #[must_use]
    pub fn new(id: i64, action_id: ActionId, update: ActionStatusUpdate) -> Self {
        Self {
            id,
            action_id,
            status: update.status,
            occurred_at: update.occurred_at,
            messages: update.messages,
        }
    }

    /// Returns the entry id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Returns the parent action id.
    #[must_use]
    pub fn action_id(&self) -> ActionId {
        self.action_id
    }

    /// Returns the recorded status.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.status
    }

    /// Returns the report timestamp.
    #[must_use]
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Returns the ordered messages.
    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}
