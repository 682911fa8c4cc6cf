//! `PostgreSQL` todo repository for Hound.
//!
//! This crate implements [`TodoRepository`] over a `sqlx` connection pool:
//!
//! - Todos live in the `todos` table; every status change is a single guarded
//!   `UPDATE` whose `WHERE` clause carries the owner and status predicate, so
//!   concurrent writers are serialized by row locks.
//! - Mutation responses live in the append-only `idempotency_keys` table and
//!   are written with `INSERT ... ON CONFLICT (key) DO NOTHING`.
//!
//! The schema is in `migrations/` and is applied by
//! [`PostgresTodoRepository::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use hound_postgres::PostgresTodoRepository;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = PostgresTodoRepository::connect("postgres://localhost/hound", 25).await?;
//! repo.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use hound_core::idempotency::IdempotencyKey;
use hound_core::store::{NewTodo, StoreError, TodoRepository, Transition};
use hound_core::todo::{ListQuery, StatusFilter, Todo, TodoId, TodoStatus};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

const TODO_COLUMNS: &str = "id, user_id, title, description, status, created_at, updated_at, completed_at, deleted_at";

/// Wait for a pooled connection before failing.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`TodoRepository`] backed by `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresTodoRepository {
    pool: PgPool,
}

impl PostgresTodoRepository {
    /// Connect a pool of at most `max_connections` to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_error(error: sqlx::Error) -> StoreError {
    if matches!(error, sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) {
        StoreError::Corrupt(error.to_string())
    } else {
        StoreError::Database(error.to_string())
    }
}

fn todo_from_row(row: &PgRow) -> Result<Todo, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    Ok(Todo {
        id: TodoId(row.try_get("id").map_err(db_error)?),
        user_id: row.try_get("user_id").map_err(db_error)?,
        title: row.try_get("title").map_err(db_error)?,
        description: row.try_get("description").map_err(db_error)?,
        status: TodoStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
        completed_at: row.try_get("completed_at").map_err(db_error)?,
        deleted_at: row.try_get("deleted_at").map_err(db_error)?,
    })
}

/// Statuses a filter admits, as stored.
fn statuses(filter: StatusFilter) -> Vec<String> {
    let admitted: &[TodoStatus] = match filter {
        StatusFilter::Active => &[TodoStatus::Active],
        StatusFilter::Completed => &[TodoStatus::Completed],
        StatusFilter::Deleted => &[TodoStatus::Deleted],
        StatusFilter::NotDeleted => &[TodoStatus::Active, TodoStatus::Completed],
    };
    admitted.iter().map(|s| s.as_str().to_string()).collect()
}

impl TodoRepository for PostgresTodoRepository {
    async fn insert(&self, todo: &NewTodo) -> Result<Todo, StoreError> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO todos (user_id, title, description, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', $4, $4)
            RETURNING {TODO_COLUMNS}
            "
        ))
        .bind(&todo.user_id)
        .bind(&todo.title)
        .bind(&todo.description)
        .bind(todo.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        todo_from_row(&row)
    }

    async fn get(&self, id: TodoId) -> Result<Option<Todo>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(todo_from_row).transpose()
    }

    async fn list(&self, user_id: &str, query: &ListQuery) -> Result<Vec<Todo>, StoreError> {
        // NULL completed_at never satisfies a bound, matching ListQuery::matches.
        let rows = sqlx::query(&format!(
            r"
            SELECT {TODO_COLUMNS}
            FROM todos
            WHERE user_id = $1
              AND status = ANY($2)
              AND ($3::timestamptz IS NULL OR completed_at > $3)
              AND ($4::timestamptz IS NULL OR completed_at < $4)
            ORDER BY created_at DESC, id DESC
            "
        ))
        .bind(user_id)
        .bind(statuses(query.status))
        .bind(query.completed_after)
        .bind(query.completed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(todo_from_row).collect()
    }

    async fn apply(
        &self,
        id: TodoId,
        user_id: &str,
        transition: &Transition,
    ) -> Result<u64, StoreError> {
        let statement = match transition {
            Transition::Complete { at } => sqlx::query(
                r"
                UPDATE todos
                SET status = 'completed', completed_at = $1, updated_at = $1
                WHERE id = $2 AND user_id = $3 AND status = 'active'
                ",
            )
            .bind(*at),
            Transition::Delete { at } => sqlx::query(
                r"
                UPDATE todos
                SET status = 'deleted', deleted_at = $1, updated_at = $1
                WHERE id = $2 AND user_id = $3 AND status <> 'deleted'
                ",
            )
            .bind(*at),
            Transition::Edit {
                title,
                description,
                at,
            } => sqlx::query(
                r"
                UPDATE todos
                SET title = COALESCE($4, title),
                    description = COALESCE($5, description),
                    updated_at = $1
                WHERE id = $2 AND user_id = $3 AND status <> 'deleted'
                ",
            )
            .bind(*at),
        };

        let mut statement = statement.bind(id.get()).bind(user_id);
        if let Transition::Edit {
            title, description, ..
        } = transition
        {
            statement = statement.bind(title.as_deref()).bind(description.as_deref());
        }

        let result = statement.execute(&self.pool).await.map_err(db_error)?;
        tracing::debug!(
            todo_id = %id,
            transition = transition.name(),
            rows = result.rows_affected(),
            "Conditional update"
        );
        Ok(result.rows_affected())
    }

    async fn find_response(&self, key: &IdempotencyKey) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT response FROM idempotency_keys WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|row| row.try_get::<Vec<u8>, _>("response").map_err(db_error))
            .transpose()
    }

    async fn record_response(
        &self,
        key: &IdempotencyKey,
        response: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO idempotency_keys (key, response, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(key.as_str())
        .bind(response)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            metrics::counter!("todo_store_idempotency_conflicts_total").increment(1);
        }
        Ok(inserted)
    }
}
