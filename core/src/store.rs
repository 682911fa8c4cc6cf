//! Persistent store boundary.
//!
//! [`TodoRepository`] is the narrow set of primitives the idempotent domain
//! store is built from: plain inserts and reads, a conditional update that
//! reports how many rows it touched, and an append-only table of cached
//! responses keyed by idempotency key.
//!
//! Conditional updates carry their own guard (owner match plus the status
//! predicate of the [`Transition`]) so that concurrent writers are serialized
//! by the database's row locks rather than by application code.

use crate::idempotency::IdempotencyKey;
use crate::todo::{ListQuery, Todo, TodoId, TodoStatus};
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

/// Errors raised by a [`TodoRepository`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not be reached or the statement failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be interpreted.
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::Corrupt(_) => false,
        }
    }
}

/// Fields of a todo about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTodo {
    /// Owner.
    pub user_id: String,
    /// Title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Creation time, also used as the initial update time.
    pub created_at: DateTime<Utc>,
}

/// A guarded state change on an existing todo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Active → completed.
    Complete {
        /// Completion time.
        at: DateTime<Utc>,
    },
    /// Active or completed → deleted.
    Delete {
        /// Deletion time.
        at: DateTime<Utc>,
    },
    /// Replace title and/or description of a non-deleted item.
    ///
    /// `None` keeps the current value.
    Edit {
        /// New title.
        title: Option<String>,
        /// New description.
        description: Option<String>,
        /// Modification time.
        at: DateTime<Utc>,
    },
}

impl Transition {
    /// Whether the transition may be applied to an item in `status`.
    #[must_use]
    pub const fn allows(&self, status: TodoStatus) -> bool {
        match self {
            Self::Complete { .. } => matches!(status, TodoStatus::Active),
            Self::Delete { .. } | Self::Edit { .. } => {
                matches!(status, TodoStatus::Active | TodoStatus::Completed)
            }
        }
    }

    /// Apply the transition to an in-memory row.
    ///
    /// Callers check [`allows`](Self::allows) first; this does not.
    pub fn apply_to(&self, todo: &mut Todo) {
        match self {
            Self::Complete { at } => {
                todo.status = TodoStatus::Completed;
                todo.completed_at = Some(*at);
                todo.updated_at = *at;
            }
            Self::Delete { at } => {
                todo.status = TodoStatus::Deleted;
                todo.deleted_at = Some(*at);
                todo.updated_at = *at;
            }
            Self::Edit {
                title,
                description,
                at,
            } => {
                if let Some(title) = title {
                    todo.title.clone_from(title);
                }
                if let Some(description) = description {
                    todo.description = Some(description.clone());
                }
                todo.updated_at = *at;
            }
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::Delete { .. } => "delete",
            Self::Edit { .. } => "edit",
        }
    }
}

/// Storage primitives for todos and idempotency records.
///
/// # Thread Safety
///
/// Implementations are shared by every handler in the process and must be
/// `Send + Sync`.
pub trait TodoRepository: Send + Sync {
    /// Insert a new active todo and return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    fn insert(&self, todo: &NewTodo) -> impl Future<Output = Result<Todo, StoreError>> + Send;

    /// Point lookup by id, regardless of owner or status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn get(&self, id: TodoId) -> impl Future<Output = Result<Option<Todo>, StoreError>> + Send;

    /// The owner's todos matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn list(
        &self,
        user_id: &str,
        query: &ListQuery,
    ) -> impl Future<Output = Result<Vec<Todo>, StoreError>> + Send;

    /// Apply `transition` to the row if it exists, is owned by `user_id` and
    /// its status [`allows`](Transition::allows) the transition.
    ///
    /// Returns the number of rows changed (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn apply(
        &self,
        id: TodoId,
        user_id: &str,
        transition: &Transition,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// The cached response recorded under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_response(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Record `response` under `key` unless a record already exists.
    ///
    /// Returns `true` if this call inserted the record and `false` if another
    /// caller got there first. Existing records are never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    fn record_response(
        &self,
        key: &IdempotencyKey,
        response: &[u8],
        created_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
