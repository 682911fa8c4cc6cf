//! In-memory todo repository.

use chrono::{DateTime, Utc};
use hound_core::idempotency::IdempotencyKey;
use hound_core::store::{NewTodo, StoreError, TodoRepository, Transition};
use hound_core::todo::{ListQuery, Todo, TodoId, TodoStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    todos: BTreeMap<TodoId, Todo>,
    responses: HashMap<IdempotencyKey, (Vec<u8>, DateTime<Utc>)>,
    last_id: i64,
    mutations: usize,
    failing_records: usize,
    racing_record: Option<Vec<u8>>,
    unavailable: bool,
}

impl State {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Database("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn insert(&mut self, todo: &NewTodo) -> Todo {
        self.last_id += 1;
        let row = Todo {
            id: TodoId(self.last_id),
            user_id: todo.user_id.clone(),
            title: todo.title.clone(),
            description: todo.description.clone(),
            status: TodoStatus::Active,
            created_at: todo.created_at,
            updated_at: todo.created_at,
            completed_at: None,
            deleted_at: None,
        };
        self.todos.insert(row.id, row.clone());
        row
    }
}

/// In-memory [`TodoRepository`] with failure injection.
///
/// Ids are assigned sequentially from 1. Every successful insert or changed
/// row counts as one mutation, which lets tests assert "at most one mutation
/// per idempotency key".
///
/// # Example
///
/// ```
/// use hound_testing::InMemoryTodoRepository;
/// use hound_core::store::{NewTodo, TodoRepository};
///
/// # tokio_test::block_on(async {
/// let repo = InMemoryTodoRepository::new();
/// let todo = repo
///     .insert(&NewTodo {
///         user_id: "+15550001111".to_string(),
///         title: "buy milk".to_string(),
///         description: None,
///         created_at: chrono::Utc::now(),
///     })
///     .await
///     .unwrap();
/// assert_eq!(todo.id.get(), 1);
/// assert_eq!(repo.mutation_count(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryTodoRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryTodoRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row directly, without counting it as a mutation.
    pub fn seed(&self, todo: &NewTodo) -> Todo {
        self.state().insert(todo)
    }

    /// Overwrite a stored row directly, without counting it as a mutation.
    pub fn overwrite(&self, todo: Todo) {
        self.state().todos.insert(todo.id, todo);
    }

    /// Snapshot of a row.
    #[must_use]
    pub fn todo(&self, id: TodoId) -> Option<Todo> {
        self.state().todos.get(&id).cloned()
    }

    /// Snapshot of every row in id order.
    #[must_use]
    pub fn todos(&self) -> Vec<Todo> {
        self.state().todos.values().cloned().collect()
    }

    /// Number of inserts plus changed rows so far.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.state().mutations
    }

    /// Number of recorded idempotency records.
    #[must_use]
    pub fn response_count(&self) -> usize {
        self.state().responses.len()
    }

    /// The raw recorded response for `key`.
    #[must_use]
    pub fn response(&self, key: &IdempotencyKey) -> Option<Vec<u8>> {
        self.state().responses.get(key).map(|(bytes, _)| bytes.clone())
    }

    /// Make the next `count` idempotency record writes fail.
    pub fn fail_next_records(&self, count: usize) {
        self.state().failing_records = count;
    }

    /// Simulate a concurrent writer: the next record write finds `winner`
    /// already stored under its key.
    pub fn race_next_record(&self, winner: Vec<u8>) {
        self.state().racing_record = Some(winner);
    }

    /// Make every operation fail with a transient database error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }
}

impl TodoRepository for InMemoryTodoRepository {
    async fn insert(&self, todo: &NewTodo) -> Result<Todo, StoreError> {
        let mut state = self.state();
        state.check_available()?;
        state.mutations += 1;
        Ok(state.insert(todo))
    }

    async fn get(&self, id: TodoId) -> Result<Option<Todo>, StoreError> {
        let state = self.state();
        state.check_available()?;
        Ok(state.todos.get(&id).cloned())
    }

    async fn list(&self, user_id: &str, query: &ListQuery) -> Result<Vec<Todo>, StoreError> {
        let state = self.state();
        state.check_available()?;
        let mut todos: Vec<Todo> = state
            .todos
            .values()
            .filter(|todo| todo.user_id == user_id && query.matches(todo))
            .cloned()
            .collect();
        todos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(todos)
    }

    async fn apply(
        &self,
        id: TodoId,
        user_id: &str,
        transition: &Transition,
    ) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.check_available()?;
        let Some(todo) = state.todos.get_mut(&id) else {
            return Ok(0);
        };
        if todo.user_id != user_id || !transition.allows(todo.status) {
            return Ok(0);
        }
        transition.apply_to(todo);
        state.mutations += 1;
        Ok(1)
    }

    async fn find_response(&self, key: &IdempotencyKey) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state();
        state.check_available()?;
        Ok(state.responses.get(key).map(|(bytes, _)| bytes.clone()))
    }

    async fn record_response(
        &self,
        key: &IdempotencyKey,
        response: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check_available()?;
        if state.failing_records > 0 {
            state.failing_records -= 1;
            return Err(StoreError::Database("injected record failure".to_string()));
        }
        if let Some(winner) = state.racing_record.take() {
            state.responses.insert(key.clone(), (winner, created_at));
        }
        if state.responses.contains_key(key) {
            return Ok(false);
        }
        state
            .responses
            .insert(key.clone(), (response.to_vec(), created_at));
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::test_clock;
    use hound_core::environment::Clock;
    use hound_core::generate_key;

    fn new_todo(user: &str, title: &str) -> NewTodo {
        NewTodo {
            user_id: user.to_string(),
            title: title.to_string(),
            description: None,
            created_at: test_clock().now(),
        }
    }

    #[tokio::test]
    async fn conditional_update_checks_owner_and_status() {
        let repo = InMemoryTodoRepository::new();
        let todo = repo.seed(&new_todo("+1", "buy milk"));
        let complete = Transition::Complete {
            at: test_clock().now(),
        };

        assert_eq!(repo.apply(todo.id, "+2", &complete).await.unwrap(), 0);
        assert_eq!(repo.apply(todo.id, "+1", &complete).await.unwrap(), 1);
        assert_eq!(repo.apply(todo.id, "+1", &complete).await.unwrap(), 0);
        assert_eq!(repo.apply(TodoId(99), "+1", &complete).await.unwrap(), 0);
        assert_eq!(repo.mutation_count(), 1);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_owner_scoped() {
        let repo = InMemoryTodoRepository::new();
        repo.seed(&new_todo("+1", "first"));
        repo.seed(&new_todo("+2", "someone else"));
        repo.seed(&new_todo("+1", "second"));

        let titles: Vec<String> = repo
            .list("+1", &ListQuery::active())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn record_is_insert_if_absent() {
        let repo = InMemoryTodoRepository::new();
        let key = generate_key("SM1");
        let at = test_clock().now();

        assert!(repo.record_response(&key, b"first", at).await.unwrap());
        assert!(!repo.record_response(&key, b"second", at).await.unwrap());
        assert_eq!(repo.find_response(&key).await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn unavailable_store_fails_transiently() {
        let repo = InMemoryTodoRepository::new();
        repo.set_unavailable(true);
        let err = repo.get(TodoId(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
