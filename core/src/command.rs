//! Classified commands.
//!
//! The intent classifier answers with a loosely typed record: an action name,
//! a string-to-string parameter map, a confidence and an explanation
//! ([`RawClassification`]). That record is converted exactly once, here, into
//! the closed [`Intent`] type. Everything downstream matches on `Intent`
//! exhaustively and never looks at parameter names again.
//!
//! Conversion rules:
//!
//! - an unknown action becomes [`Intent::Unclear`]
//! - a `todo_id` that does not parse as an integer (an optional leading `#`
//!   is accepted) is treated as absent, falling back to `title_hint`
//! - empty or whitespace-only parameters count as absent
//! - confidence is clamped into `[0, 1]`
//! - malformed date bounds on a listing are ignored

use crate::todo::{ListQuery, StatusFilter, TodoId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Confidence below which the classifier's explanation is shown to the user.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.85;

/// Classifier output as received, before validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawClassification {
    /// Action name.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Why the classifier chose this action.
    #[serde(default)]
    pub explanation: String,
}

impl RawClassification {
    /// Classification with no parameters.
    #[must_use]
    pub fn new(action: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: action.into(),
            parameters: HashMap::new(),
            confidence,
            explanation: String::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the explanation.
    #[must_use]
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    fn param(&self, key: &str) -> Option<String> {
        self.parameters
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// The item a mutating command refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Explicit id.
    Id(TodoId),
    /// Phrase to match against titles.
    Hint(String),
}

/// Mutations that need a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Mark done.
    Complete,
    /// Remove.
    Delete,
    /// Change title or description.
    Edit,
}

impl Verb {
    /// The verb as it appears in replies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Delete => "delete",
            Self::Edit => "edit",
        }
    }
}

/// A recognized action that lacks something required to carry it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clarification {
    /// `create` without a title.
    MissingTitle,
    /// `complete`, `delete` or `edit` without an id or hint.
    MissingTarget(Verb),
    /// `edit` with neither a new title nor a new description.
    MissingChanges,
    /// `nudge` without a suggested action.
    MissingNudge,
}

/// A validated user intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Add a todo.
    Create {
        /// Title.
        title: String,
        /// Optional description.
        description: Option<String>,
    },
    /// Mark a todo done.
    Complete {
        /// Which todo.
        target: Target,
    },
    /// Show todos.
    List(ListQuery),
    /// Remove a todo.
    Delete {
        /// Which todo.
        target: Target,
    },
    /// Change a todo.
    Edit {
        /// Which todo.
        target: Target,
        /// New title, if any.
        title: Option<String>,
        /// New description, if any.
        description: Option<String>,
    },
    /// Suggest a tiny first step.
    Nudge {
        /// The suggested step.
        suggested_action: String,
        /// What the user is trying to start.
        task_context: Option<String>,
    },
    /// The classifier could not tell what the user wants.
    Unclear {
        /// Classifier-supplied reason.
        reason: Option<String>,
    },
    /// A known action missing a required parameter.
    Clarify(Clarification),
}

impl Intent {
    /// Action name for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Complete { .. } => "complete",
            Self::List(_) => "list",
            Self::Delete { .. } => "delete",
            Self::Edit { .. } => "edit",
            Self::Nudge { .. } => "nudge",
            Self::Unclear { .. } => "unclear",
            Self::Clarify(_) => "clarify",
        }
    }

    /// Whether carrying out the intent changes stored state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        match self {
            Self::Create { .. } | Self::Complete { .. } | Self::Delete { .. } | Self::Edit { .. } => {
                true
            }
            Self::List(_) | Self::Nudge { .. } | Self::Unclear { .. } | Self::Clarify(_) => false,
        }
    }
}

/// A classified, validated command.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedCommand {
    /// What to do.
    pub intent: Intent,
    /// Classifier confidence, clamped to `[0, 1]`.
    pub confidence: f64,
    /// Classifier explanation, if non-empty.
    pub explanation: Option<String>,
}

impl ClassifiedCommand {
    /// Command with full confidence and no explanation.
    #[must_use]
    pub const fn certain(intent: Intent) -> Self {
        Self {
            intent,
            confidence: 1.0,
            explanation: None,
        }
    }

    /// The explanation to append to the reply, if confidence is low.
    #[must_use]
    pub fn low_confidence_note(&self) -> Option<&str> {
        if self.confidence < LOW_CONFIDENCE_THRESHOLD {
            self.explanation.as_deref()
        } else {
            None
        }
    }
}

impl From<RawClassification> for ClassifiedCommand {
    fn from(raw: RawClassification) -> Self {
        let confidence = if raw.confidence.is_nan() {
            0.0
        } else {
            raw.confidence.clamp(0.0, 1.0)
        };
        let explanation = Some(raw.explanation.trim().to_string()).filter(|e| !e.is_empty());

        Self {
            intent: parse_intent(&raw),
            confidence,
            explanation,
        }
    }
}

fn parse_intent(raw: &RawClassification) -> Intent {
    match raw.action.trim().to_ascii_lowercase().as_str() {
        "create" => match raw.param("title") {
            Some(title) => Intent::Create {
                title,
                description: raw.param("description"),
            },
            None => Intent::Clarify(Clarification::MissingTitle),
        },
        "complete" => match parse_target(raw) {
            Some(target) => Intent::Complete { target },
            None => Intent::Clarify(Clarification::MissingTarget(Verb::Complete)),
        },
        "delete" => match parse_target(raw) {
            Some(target) => Intent::Delete { target },
            None => Intent::Clarify(Clarification::MissingTarget(Verb::Delete)),
        },
        "edit" => {
            let title = raw.param("new_title");
            let description = raw.param("new_description");
            if title.is_none() && description.is_none() {
                return Intent::Clarify(Clarification::MissingChanges);
            }
            match parse_target(raw) {
                Some(target) => Intent::Edit {
                    target,
                    title,
                    description,
                },
                None => Intent::Clarify(Clarification::MissingTarget(Verb::Edit)),
            }
        }
        "list" => Intent::List(parse_list(raw)),
        "nudge" => match raw.param("suggested_action") {
            Some(suggested_action) => Intent::Nudge {
                suggested_action,
                task_context: raw.param("task_context"),
            },
            None => Intent::Clarify(Clarification::MissingNudge),
        },
        "unclear" => Intent::Unclear {
            reason: raw.param("reason"),
        },
        _ => Intent::Unclear { reason: None },
    }
}

fn parse_target(raw: &RawClassification) -> Option<Target> {
    let id = raw.param("todo_id").and_then(|id| {
        id.trim_start_matches('#')
            .trim()
            .parse::<i64>()
            .ok()
            .map(TodoId)
    });
    match id {
        Some(id) => Some(Target::Id(id)),
        None => raw.param("title_hint").map(Target::Hint),
    }
}

fn parse_list(raw: &RawClassification) -> ListQuery {
    let completed_after = raw.param("completed_after").and_then(|s| parse_instant(&s));
    let completed_before = raw.param("completed_before").and_then(|s| parse_instant(&s));
    let bounded = completed_after.is_some() || completed_before.is_some();

    let status = match raw.param("filter").as_deref() {
        Some("completed") => StatusFilter::Completed,
        Some("all") => StatusFilter::NotDeleted,
        Some("active") => StatusFilter::Active,
        // Completion bounds only make sense for completed items.
        Some(_) | None if bounded => StatusFilter::Completed,
        Some(_) | None => StatusFilter::Active,
    };

    ListQuery {
        status,
        completed_after,
        completed_before,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
