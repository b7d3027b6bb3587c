use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use converse::events::{
    EventEngine, EventStatus, FnMiddleware, InMemoryEventStore, Middleware, MiddlewareOutcome,
    MiddlewareRegistration, SearchParams,
};
use converse::sdk::{Event, EventDestination, EventDirection, EventPayload, WellKnownFlag};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn engine() -> EventEngine {
    EventEngine::new(Arc::new(InMemoryEventStore::new()), Duration::from_secs(1))
}

fn incoming(conversation: &str, text: &str) -> Event {
    Event::incoming(
        EventDestination::new("webchat", "demo", conversation, "u1"),
        EventPayload::text(text),
    )
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Records `<name>:<text>` and sleeps when the text asks for it.
struct Trace {
    name: &'static str,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Trace {
    async fn handle(&self, event: &mut Event) -> anyhow::Result<MiddlewareOutcome> {
        let text = event.payload.as_text().unwrap_or_default().to_string();
        if text.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        self.seen.lock().unwrap().push(format!("{}:{text}", self.name));
        Ok(MiddlewareOutcome::Continue)
    }
}

#[tokio::test]
async fn chain_runs_by_priority_then_registration() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for (name, priority) in [("late", 20), ("first", 1), ("early-a", 10), ("early-b", 10)] {
        engine
            .register(
                MiddlewareRegistration::incoming(name, Arc::new(Trace { name, seen: seen.clone() }))
                    .priority(priority),
            )
            .unwrap();
    }
    assert_eq!(
        engine.middleware_names(EventDirection::Incoming),
        vec!["first", "early-a", "early-b", "late"]
    );

    engine.send_event(incoming("c1", "hi")).await.unwrap();
    assert!(engine.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first:hi", "early-a:hi", "early-b:hi", "late:hi"]
    );
}

#[tokio::test]
async fn same_conversation_is_processed_in_submission_order() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    engine
        .register(MiddlewareRegistration::incoming(
            "trace",
            Arc::new(Trace { name: "t", seen: seen.clone() }),
        ))
        .unwrap();

    // the first event is slow, the second must still wait for it
    engine.send_event(incoming("c1", "slow-1")).await.unwrap();
    engine.send_event(incoming("c1", "fast-2")).await.unwrap();
    // another conversation is not held back
    engine.send_event(incoming("c2", "other")).await.unwrap();
    assert!(engine.wait_idle(Duration::from_secs(2)).await);

    let seen = seen.lock().unwrap().clone();
    let c1: Vec<_> = seen.iter().filter(|s| !s.ends_with("other")).cloned().collect();
    assert_eq!(c1, vec!["t:slow-1", "t:fast-2"]);
    assert_eq!(seen.first().map(String::as_str), Some("t:other"));
}

#[tokio::test]
async fn store_round_trip_through_the_engine() {
    let engine = engine();
    engine
        .register(MiddlewareRegistration::incoming(
            "tagger",
            Arc::new(FnMiddleware(|event: &mut Event| {
                event.flags.set_custom("tagged");
                Ok(MiddlewareOutcome::Continue)
            })),
        ))
        .unwrap();

    let first = incoming("c1", "one");
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = incoming("c1", "two");
    let skipped = {
        let mut e = incoming("c1", "three");
        e.flags.set(WellKnownFlag::SkipStore, true);
        e
    };
    let first_id = first.id.clone();
    engine.send_event(first).await.unwrap();
    engine.send_event(second).await.unwrap();
    engine.send_event(skipped).await.unwrap();
    assert!(engine.wait_idle(Duration::from_secs(2)).await);

    let found = engine
        .find_events(
            &fields(json!({ "destination.conversation_id": "c1", "status": "completed" })),
            &SearchParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].event.id, first_id);
    assert!(found.iter().all(|e| e.event.flags.has_custom("tagged")));
    assert!(found.iter().all(|e| e.processed_by == vec!["tagger"]));

    let updated = engine
        .update_event(&first_id, &fields(json!({ "state.topic": "billing" })))
        .await
        .unwrap();
    assert_eq!(updated.event.state.get("topic"), Some(&json!("billing")));

    let newest = engine
        .find_events(&Map::new(), &SearchParams::sorted_by("created_at").descending().limit(1))
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);
    assert_ne!(newest[0].event.id, first_id);

    engine.save_user_feedback(&first_id, "reply", 1, "thumbs").await.unwrap();
    let stored = engine.store().get(&first_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Completed);
    assert_eq!(stored.feedback.len(), 1);
}

#[tokio::test]
async fn replies_run_the_outgoing_chain_before_delivery() {
    let engine = engine();
    engine
        .register(MiddlewareRegistration::outgoing(
            "signature",
            Arc::new(FnMiddleware(|event: &mut Event| {
                if let Some(text) = event.payload.as_text() {
                    event.payload = EventPayload::text(format!("{text} -- bot"));
                }
                Ok(MiddlewareOutcome::Continue)
            })),
        ))
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    engine.subscribe_outgoing(Arc::new(tx));

    let request = incoming("c1", "hi");
    let ids = engine
        .reply_to_event(
            request.destination.clone(),
            vec![EventPayload::text("a"), EventPayload::text("b")],
            &request,
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let a = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let b = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(a.payload.as_text(), Some("a -- bot"));
    assert_eq!(b.payload.as_text(), Some("b -- bot"));
    assert_eq!(a.incoming_event_id.as_deref(), Some(request.id.as_str()));
    assert_eq!(a.thread_id.as_deref(), Some(request.id.as_str()));
}
