//! Todo domain model.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned todo identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(pub i64);

impl TodoId {
    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a todo.
///
/// `Active` may move to `Completed` or `Deleted`; `Completed` may move to
/// `Deleted`. No transition leaves `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    /// Open item.
    Active,
    /// Done.
    Completed,
    /// Soft-deleted.
    Deleted,
}

impl TodoStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "deleted" => Ok(Self::Deleted),
            _ => Err(StoreError::Corrupt(format!("Invalid todo status: {s}"))),
        }
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single todo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    /// Identifier.
    pub id: TodoId,
    /// Owner (phone number).
    pub user_id: String,
    /// Short title.
    pub title: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Lifecycle state.
    pub status: TodoStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the item was completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the item was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Todo {
    /// Whether `user_id` owns this item.
    #[must_use]
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Which statuses a listing includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    /// Only active items.
    #[default]
    Active,
    /// Only completed items.
    Completed,
    /// Only deleted items.
    Deleted,
    /// Everything that has not been deleted.
    NotDeleted,
}

impl StatusFilter {
    /// Whether `status` passes this filter.
    #[must_use]
    pub const fn matches(self, status: TodoStatus) -> bool {
        match (self, status) {
            (Self::Active, TodoStatus::Active)
            | (Self::Completed, TodoStatus::Completed)
            | (Self::Deleted, TodoStatus::Deleted)
            | (Self::NotDeleted, TodoStatus::Active | TodoStatus::Completed) => true,
            (Self::Active, TodoStatus::Completed | TodoStatus::Deleted)
            | (Self::Completed, TodoStatus::Active | TodoStatus::Deleted)
            | (Self::Deleted, TodoStatus::Active | TodoStatus::Completed)
            | (Self::NotDeleted, TodoStatus::Deleted) => false,
        }
    }
}

/// Parameters of an owner listing.
///
/// Results are ordered newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListQuery {
    /// Status filter.
    pub status: StatusFilter,
    /// Only items completed strictly after this instant.
    pub completed_after: Option<DateTime<Utc>>,
    /// Only items completed strictly before this instant.
    pub completed_before: Option<DateTime<Utc>>,
}

impl ListQuery {
    /// Listing of active items.
    #[must_use]
    pub fn active() -> Self {
        Self::default()
    }

    /// Whether a completion-time bound is set.
    #[must_use]
    pub const fn has_date_bounds(&self) -> bool {
        self.completed_after.is_some() || self.completed_before.is_some()
    }

    /// Whether `todo` passes the status filter and the completion-time bounds.
    ///
    /// An item without a completion time never passes a bounded query.
    #[must_use]
    pub fn matches(&self, todo: &Todo) -> bool {
        if !self.status.matches(todo.status) {
            return false;
        }
        if !self.has_date_bounds() {
            return true;
        }
        let Some(completed_at) = todo.completed_at else {
            return false;
        };
        self.completed_after.is_none_or(|after| completed_at > after)
            && self.completed_before.is_none_or(|before| completed_at < before)
    }
}
