//! Scripted external collaborators.

use hound_core::collaborator::{ClassifierError, IntentClassifier, NotificationSender, NotifyError};
use hound_core::command::RawClassification;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct ClassifierState {
    answers: HashMap<String, RawClassification>,
    failures: VecDeque<ClassifierError>,
    calls: Vec<String>,
}

/// [`IntentClassifier`] that answers from a script.
///
/// Messages without a scripted answer classify as `unclear`. Scripted
/// failures are returned first, one per call, before any answer.
///
/// # Example
///
/// ```
/// use hound_testing::ScriptedClassifier;
/// use hound_core::collaborator::IntentClassifier;
/// use hound_core::command::RawClassification;
///
/// # tokio_test::block_on(async {
/// let classifier = ScriptedClassifier::new().answer(
///     "buy milk",
///     RawClassification::new("create", 0.95).with_param("title", "buy milk"),
/// );
/// let raw = classifier.classify("buy milk").await.unwrap();
/// assert_eq!(raw.action, "create");
/// assert_eq!(classifier.call_count(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedClassifier {
    state: Arc<Mutex<ClassifierState>>,
}

impl ScriptedClassifier {
    /// Classifier with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClassifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `text` with `classification`.
    #[must_use]
    pub fn answer(self, text: impl Into<String>, classification: RawClassification) -> Self {
        self.state().answers.insert(text.into(), classification);
        self
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: ClassifierError) {
        self.state().failures.push_back(error);
    }

    /// Number of calls so far, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Texts passed to the classifier, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

impl IntentClassifier for ScriptedClassifier {
    async fn classify(&self, text: &str) -> Result<RawClassification, ClassifierError> {
        let mut state = self.state();
        state.calls.push(text.to_string());
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .answers
            .get(text)
            .cloned()
            .unwrap_or_else(|| RawClassification::new("unclear", 0.0)))
    }
}

/// A message captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Recipient.
    pub recipient: String,
    /// Message text.
    pub text: String,
}

#[derive(Debug, Default)]
struct NotifierState {
    sent: Vec<SentMessage>,
    failures: VecDeque<NotifyError>,
}

/// [`NotificationSender`] that records what it was asked to send.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl RecordingNotifier {
    /// Notifier with nothing sent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next send with `error`.
    pub fn fail_next(&self, error: NotifyError) {
        self.state().failures.push_back(error);
    }

    /// Messages sent successfully, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }
}

impl NotificationSender for RecordingNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        let mut state = self.state();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.sent.push(SentMessage {
            recipient: recipient.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}
