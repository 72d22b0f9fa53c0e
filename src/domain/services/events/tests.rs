use std::sync::Arc;
use std::time::Duration;

use mockall::mock;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use crate::domain::models::types::{RelayErrorCode, TopicMessage, TopicPayload};
use crate::domain::services::events::{
    EventBus, EventError, EventLogger, EventResult, MessageDispatcher, TopicListener,
};

mock! {
    pub Listener {}

    #[async_trait::async_trait]
    impl TopicListener for Listener {
        async fn on_topic_message(&self, message: TopicMessage) -> EventResult<()>;
    }
}

// Mock listener that reports the topic of every call on a channel
fn recording_listener(calls: usize) -> (MockListener, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut listener = MockListener::new();
    listener
        .expect_on_topic_message()
        .times(calls)
        .returning(move |message| {
            let _ = tx.send(message.topic);
            Ok(())
        });
    (listener, rx)
}

async fn next_topic(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("listener was not called")
        .expect("listener channel closed")
}

#[tokio::test]
async fn test_json_payloads_are_forwarded_structured() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let mut feed = dispatcher.subscribe();

    dispatcher.dispatch("robot-a", "runs/1", br#"{"status":"running"}"#);

    let message = feed.recv().await.unwrap();
    assert_eq!(message.host, "robot-a");
    assert_eq!(message.topic, "runs/1");
    assert_eq!(message.payload, TopicPayload::Json(json!({"status": "running"})));
}

#[tokio::test]
async fn test_non_json_payloads_fall_back_to_text() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let mut feed = dispatcher.subscribe();

    dispatcher.dispatch("robot-a", "runs/1", b"not { json");

    let message = feed.recv().await.unwrap();
    assert_eq!(message.payload, TopicPayload::Raw("not { json".to_string()));
    assert!(!message.is_error());
}

#[tokio::test]
async fn test_error_payload_is_distinguished() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let mut feed = dispatcher.subscribe();

    dispatcher.dispatch_error("robot-a", "runs/1", RelayErrorCode::ConnectionFailed);

    let message = feed.recv().await.unwrap();
    assert!(message.is_error());
    assert_eq!(
        message.payload,
        TopicPayload::Error(RelayErrorCode::ConnectionFailed)
    );
}

#[tokio::test]
async fn test_listener_only_sees_matching_host_and_filter_in_order() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let (listener, mut calls) = recording_listener(3);
    dispatcher
        .register_listener("robot-a", "runs/+", Arc::new(listener))
        .await;
    let _handle = dispatcher.start();

    dispatcher.dispatch("robot-a", "runs/1", b"{}");
    dispatcher.dispatch("robot-a", "other/1", b"{}");
    dispatcher.dispatch("robot-b", "runs/1", b"{}");
    dispatcher.dispatch("robot-a", "runs/2", b"{}");
    dispatcher.dispatch("robot-a", "runs/end", b"{}");

    assert_eq!(next_topic(&mut calls).await, "runs/1");
    assert_eq!(next_topic(&mut calls).await, "runs/2");
    assert_eq!(next_topic(&mut calls).await, "runs/end");
}

#[tokio::test]
async fn test_every_matching_listener_is_called() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let (exact, mut exact_calls) = recording_listener(1);
    let (wildcard, mut wildcard_calls) = recording_listener(1);
    dispatcher
        .register_listener("robot-a", "runs/1", Arc::new(exact))
        .await;
    dispatcher
        .register_listener("robot-a", "#", Arc::new(wildcard))
        .await;
    let _handle = dispatcher.start();

    dispatcher.dispatch("robot-a", "runs/1", b"hello");

    assert_eq!(next_topic(&mut exact_calls).await, "runs/1");
    assert_eq!(next_topic(&mut wildcard_calls).await, "runs/1");
}

#[tokio::test]
async fn test_failing_listener_does_not_stop_delivery() {
    let dispatcher = MessageDispatcher::new(EventBus::default());
    let (tx, mut calls) = mpsc::unbounded_channel();
    let mut listener = MockListener::new();
    let mut first = true;
    listener
        .expect_on_topic_message()
        .times(2)
        .returning(move |message| {
            let _ = tx.send(message.topic);
            if std::mem::take(&mut first) {
                Err(EventError::ListenerError("boom".to_string()))
            } else {
                Ok(())
            }
        });
    dispatcher
        .register_listener("robot-a", "#", Arc::new(listener))
        .await;
    let _handle = dispatcher.start();

    dispatcher.dispatch("robot-a", "t/1", b"1");
    dispatcher.dispatch("robot-a", "t/2", b"2");

    assert_eq!(next_topic(&mut calls).await, "t/1");
    assert_eq!(next_topic(&mut calls).await, "t/2");
}

#[tokio::test]
async fn test_event_logger_keeps_bounded_history() {
    let logger = EventLogger::new(2);
    for topic in ["a", "b", "c"] {
        logger
            .on_topic_message(TopicMessage::new("h", topic, TopicPayload::Raw(String::new())))
            .await
            .unwrap();
    }

    let topics: Vec<String> = logger
        .get_history()
        .await
        .into_iter()
        .map(|m| m.topic)
        .collect();
    assert_eq!(topics, vec!["b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_a_noop() {
    let bus = EventBus::new(8);
    assert_eq!(bus.subscriber_count(), 0);
    assert!(
        bus.publish(TopicMessage::new("h", "t", TopicPayload::Raw("x".into())))
            .is_ok()
    );
    assert_eq!(bus.capacity(), 8);
}

// Listener that reports each call and stalls on "first" until released
struct StallingListener {
    gate: Arc<Notify>,
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl TopicListener for StallingListener {
    async fn on_topic_message(&self, message: TopicMessage) -> EventResult<()> {
        let _ = self.tx.send(message.topic.clone());
        if message.topic == "first" {
            self.gate.notified().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stalled_listener_skips_what_the_bus_dropped() {
    let dispatcher = MessageDispatcher::new(EventBus::new(2));
    let gate = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher
        .register_listener(
            "robot-a",
            "#",
            Arc::new(StallingListener {
                gate: Arc::clone(&gate),
                tx,
            }),
        )
        .await;
    let _handle = dispatcher.start();

    dispatcher.dispatch("robot-a", "first", b"{}");
    assert_eq!(next_topic(&mut rx).await, "first");

    for topic in ["t1", "t2", "t3", "t4", "t5"] {
        dispatcher.dispatch("robot-a", topic, b"{}");
    }
    gate.notify_one();

    assert_eq!(next_topic(&mut rx).await, "t4");
    assert_eq!(next_topic(&mut rx).await, "t5");
}
