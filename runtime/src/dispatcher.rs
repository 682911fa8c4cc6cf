//! Intent dispatch and reply rendering.
//!
//! Each [`Intent`] maps to at most one domain operation. Domain outcomes the
//! user can act on ([`DomainError::NotFound`], [`DomainError::NotOwner`]) are
//! rendered as replies; only store failures escape as errors, so the consumer
//! can decide whether to retry.

use crate::domain_store::DomainStore;
use hound_core::command::{Clarification, ClassifiedCommand, Intent, Target, Verb};
use hound_core::error::DomainError;
use hound_core::idempotency::IdempotencyKey;
use hound_core::store::{StoreError, TodoRepository};
use hound_core::todo::{ListQuery, Todo, TodoId, TodoStatus};
use std::fmt::Write as _;

const EMPTY_LIST: &str = "Your list is empty! Text me something to remember.";
const EMPTY_RANGE: &str = "No completed todos found in that time range.";
const UNCLEAR_HELP: &str =
    "I didn't understand. Try 'add [task]', 'done with [task]', or 'show my list'";
const MISSING_TITLE: &str =
    "I couldn't figure out what to add. What would you like me to remember?";
const MISSING_CHANGES: &str = "What do you want to change it to?";
const MISSING_NUDGE: &str = "I'm not sure how to help with that. What are you trying to start?";

/// The mutation a targeted intent performs.
enum Mutation<'a> {
    Complete,
    Delete,
    Edit {
        title: Option<&'a str>,
        description: Option<&'a str>,
    },
}

impl Mutation<'_> {
    const fn verb(&self) -> Verb {
        match self {
            Self::Complete => Verb::Complete,
            Self::Delete => Verb::Delete,
            Self::Edit { .. } => Verb::Edit,
        }
    }

    fn render(&self, todo: &Todo) -> String {
        match self {
            Self::Complete => format!("Completed #{}: {} ✓", todo.id, todo.title),
            Self::Delete => format!("Deleted #{}: {}", todo.id, todo.title),
            Self::Edit { .. } => format!("Updated #{}: {}", todo.id, todo.title),
        }
    }
}

/// Carries out classified commands against the idempotent domain store.
pub struct CommandDispatcher<R> {
    store: DomainStore<R>,
}

impl<R: TodoRepository> CommandDispatcher<R> {
    /// Create a dispatcher over `store`.
    #[must_use]
    pub const fn new(store: DomainStore<R>) -> Self {
        Self { store }
    }

    /// The underlying domain store.
    #[must_use]
    pub const fn store(&self) -> &DomainStore<R> {
        &self.store
    }

    /// Carry out `command` for `user_id` under `key` and render the reply.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails; every domain outcome is
    /// rendered as a reply instead.
    pub async fn dispatch(
        &self,
        user_id: &str,
        key: &IdempotencyKey,
        command: &ClassifiedCommand,
    ) -> Result<String, StoreError> {
        tracing::debug!(
            user_id,
            action = command.intent.name(),
            confidence = command.confidence,
            "Dispatching command"
        );

        match &command.intent {
            Intent::Create { title, description } => {
                match self
                    .store
                    .create_todo(key, user_id, title, description.as_deref())
                    .await
                {
                    Ok(todo) => Ok(format!("Added #{}: {}", todo.id, todo.title)),
                    Err(error) => render_domain_error(error),
                }
            }
            Intent::Complete { target } => {
                self.mutate(user_id, key, target, &Mutation::Complete).await
            }
            Intent::Delete { target } => self.mutate(user_id, key, target, &Mutation::Delete).await,
            Intent::Edit {
                target,
                title,
                description,
            } => {
                let edit = Mutation::Edit {
                    title: title.as_deref(),
                    description: description.as_deref(),
                };
                self.mutate(user_id, key, target, &edit).await
            }
            Intent::List(query) => self.list(user_id, query).await,
            Intent::Nudge {
                suggested_action,
                task_context,
            } => Ok(match task_context {
                Some(context) => format!("For {context}: {suggested_action}"),
                None => suggested_action.clone(),
            }),
            Intent::Unclear { reason } => Ok(match reason {
                Some(reason) => format!("I didn't quite understand that. {reason}"),
                None => UNCLEAR_HELP.to_string(),
            }),
            Intent::Clarify(clarification) => Ok(render_clarification(*clarification)),
        }
    }

    async fn mutate(
        &self,
        user_id: &str,
        key: &IdempotencyKey,
        target: &Target,
        mutation: &Mutation<'_>,
    ) -> Result<String, StoreError> {
        let id = match target {
            Target::Id(id) => *id,
            Target::Hint(hint) => {
                // A redelivered hint command may no longer match (the item it
                // completed is no longer active), so answer from the record.
                if let Some(todo) = self.store.replay::<Todo>(key).await? {
                    return Ok(mutation.render(&todo));
                }
                match self.store.find_by_title(user_id, hint).await? {
                    Some(todo) => todo.id,
                    None => return Ok(format!("I couldn't find a todo matching '{hint}'")),
                }
            }
        };

        let result = match mutation {
            Mutation::Complete => self.store.complete_todo(key, id, user_id).await,
            Mutation::Delete => self.store.delete_todo(key, id, user_id).await,
            Mutation::Edit { title, description } => {
                self.store
                    .edit_todo(key, id, user_id, *title, *description)
                    .await
            }
        };

        match result {
            Ok(todo) => Ok(mutation.render(&todo)),
            Err(error) => {
                tracing::info!(
                    todo_id = %id,
                    user_id,
                    verb = mutation.verb().as_str(),
                    error = %error,
                    "Mutation refused"
                );
                render_domain_error(error)
            }
        }
    }

    async fn list(&self, user_id: &str, query: &ListQuery) -> Result<String, StoreError> {
        let todos = self.store.list_todos(user_id, query).await?;
        if todos.is_empty() {
            let empty = if query.has_date_bounds() {
                EMPTY_RANGE
            } else {
                EMPTY_LIST
            };
            return Ok(empty.to_string());
        }

        let mut reply = String::from("Your todos:");
        for todo in &todos {
            let _ = write!(reply, "\n#{}: {}", todo.id, todo.title);
            if todo.status == TodoStatus::Completed {
                reply.push_str(" ✓");
            }
        }
        Ok(reply)
    }
}

fn render_domain_error(error: DomainError) -> Result<String, StoreError> {
    match error {
        DomainError::NotFound(id) => Ok(not_found(id)),
        DomainError::NotOwner(id) => Ok(format!("#{id} isn't on your list.")),
        DomainError::Store(error) => Err(error),
    }
}

fn not_found(id: TodoId) -> String {
    format!("I couldn't find #{id}.")
}

fn render_clarification(clarification: Clarification) -> String {
    match clarification {
        Clarification::MissingTitle => MISSING_TITLE.to_string(),
        Clarification::MissingChanges => MISSING_CHANGES.to_string(),
        Clarification::MissingNudge => MISSING_NUDGE.to_string(),
        Clarification::MissingTarget(verb) => format!(
            "Which todo do you want to {}? Give me a number or describe it.",
            verb.as_str()
        ),
    }
}
