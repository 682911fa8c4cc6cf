//! The whole service over in-memory doubles: webhook in, notification out.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use hound_core::command::RawClassification;
use hound_core::queue::DurableQueue;
use hound_runtime::{CommandProducer, DomainStore, RetryPolicy, shutdown};
use hound_testing::{
    InMemoryQueue, InMemoryTodoRepository, RecordingNotifier, ScriptedClassifier, test_clock,
};
use hound_worker::ingress;
use hound_worker::service::{self, PipelineSettings};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn webhook(sid: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook/sms")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!(
            "From=%2B15550001111&Body={body}&MessageSid={sid}&NumMedia=0"
        )))
        .unwrap()
}

async fn wait_for(notifier: &RecordingNotifier, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while notifier.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("replies were not delivered in time");
}

#[tokio::test]
async fn webhook_to_notification() {
    let queue = InMemoryQueue::new();
    let shared: Arc<dyn DurableQueue> = Arc::new(queue.clone());
    let repo = InMemoryTodoRepository::new();
    let notifier = RecordingNotifier::new();
    let classifier = ScriptedClassifier::new()
        .answer(
            "buy milk",
            RawClassification::new("create", 0.95).with_param("title", "buy milk"),
        )
        .answer("what's on my list", RawClassification::new("list", 0.95));
    let settings = PipelineSettings {
        policy: RetryPolicy::default(),
        publish_timeout: Duration::from_secs(1),
    };

    let commands = service::command_worker(
        Arc::clone(&shared),
        DomainStore::new(repo.clone(), Arc::new(test_clock())),
        classifier,
        &settings,
    );
    let replies = service::reply_worker(Arc::clone(&shared), notifier.clone(), &settings);

    let (trigger, signal) = shutdown::channel();
    let commands_signal = signal.clone();
    let commands = tokio::spawn(async move { commands.run(commands_signal).await });
    let replies = tokio::spawn(async move { replies.run(signal).await });

    let app = ingress::router(CommandProducer::new(Arc::clone(&shared)));
    for (sid, body) in [("SM1", "buy+milk"), ("SM1", "buy+milk"), ("SM2", "what's+on+my+list")] {
        let response = app.clone().oneshot(webhook(sid, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    wait_for(&notifier, 3).await;
    trigger.trigger();
    let commands = commands.await.unwrap().unwrap();
    let replies = replies.await.unwrap().unwrap();

    assert_eq!(commands.acked, 3);
    assert_eq!(replies.acked, 3);
    assert_eq!(repo.todos().len(), 1);

    let texts: Vec<String> = notifier.sent().into_iter().map(|m| m.text).collect();
    assert_eq!(
        texts,
        vec![
            "Added #1: buy milk".to_string(),
            "Added #1: buy milk".to_string(),
            "Your todos:\n#1: buy milk".to_string(),
        ]
    );
}
