use std::sync::Arc;
use std::time::Duration;

use converse::config::RuntimeConfig;
use converse::dialog::{Action, DialogEngine, DialogError, Flow, Node, Transition};
use converse::events::EventStatus;
use converse::runtime::Runtime;
use converse::sdk::{Event, EventDestination, EventPayload, WellKnownFlag};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn node(on_enter: Vec<Action>, next: Vec<Transition>) -> Node {
    Node {
        on_enter,
        wait_for_input: true,
        next,
    }
}

fn say(text: &str) -> Action {
    Action::Say { text: text.into() }
}

fn to_c1(text: &str) -> Event {
    Event::incoming(
        EventDestination::new("webchat", "demo", "c1", "u1"),
        EventPayload::text(text),
    )
}

async fn runtime(flows: Vec<Flow>) -> (Runtime, mpsc::UnboundedReceiver<Event>) {
    let runtime = Runtime::new(RuntimeConfig {
        instance_id: "dialog-test".into(),
        ..RuntimeConfig::default()
    })
    .await
    .unwrap();
    runtime.flows().register("demo", flows).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.events().subscribe_outgoing(Arc::new(tx));
    (runtime, rx)
}

fn age_flow() -> Flow {
    Flow::new("main", "start")
        .with_node("start", node(vec![], vec![Transition::to_node("ask")]))
        .with_node(
            "ask",
            node(
                vec![say("How old are you?")],
                vec![Transition::to_node("adult").when("parse_int(event.payload.text) >= 18")],
            ),
        )
        .with_node("adult", node(vec![say("Welcome!")], vec![]))
}

#[tokio::test]
async fn demo_conversation_emits_one_reply_to_c1() {
    let greeting = Flow::new("main", "start")
        .with_node("start", node(vec![], vec![Transition::to_node("greet")]))
        .with_node("greet", node(vec![say("Hello!")], vec![]));
    let (runtime, mut rx) = runtime(vec![greeting]).await;

    let event = to_c1("hi");
    let event_id = event.id.clone();
    runtime.events().send_event(event).await.unwrap();

    let reply = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply.destination.conversation_id, "c1");
    assert_eq!(reply.destination.channel, "webchat");
    assert_eq!(reply.payload.as_text(), Some("Hello!"));
    assert_eq!(reply.incoming_event_id.as_deref(), Some(event_id.as_str()));

    assert!(runtime.events().wait_idle(Duration::from_secs(2)).await);
    assert!(rx.try_recv().is_err(), "exactly one outgoing event");

    let stored = runtime.events().store().get(&event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Completed);
    assert!(stored.event.flags.has(WellKnownFlag::AlreadyReplied));
    runtime.shutdown().await;
}

#[tokio::test]
async fn failed_transition_keeps_session_and_retry_succeeds() {
    let (runtime, mut rx) = runtime(vec![age_flow()]).await;
    let first = to_c1("hi");
    let session_id = DialogEngine::create_id(&first);

    runtime.events().send_event(first).await.unwrap();
    let question = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(question.payload.as_text(), Some("How old are you?"));
    assert!(runtime.events().wait_idle(Duration::from_secs(2)).await);
    let before = runtime.dialog().sessions().get(&session_id).await.unwrap().unwrap();
    assert_eq!(before.position(), Some(("main", "ask")));

    // not a number: the condition fails to evaluate
    let bad = to_c1("abc");
    let bad_id = bad.id.clone();
    runtime.events().send_event(bad).await.unwrap();
    assert!(runtime.events().wait_idle(Duration::from_secs(2)).await);

    let failed = runtime.events().store().get(&bad_id).await.unwrap().unwrap();
    assert_eq!(failed.status, EventStatus::Failed);
    assert!(failed.error.is_some());
    let after = runtime.dialog().sessions().get(&session_id).await.unwrap().unwrap();
    assert_eq!(after, before);
    assert!(rx.try_recv().is_err());

    runtime.events().send_event(to_c1("30")).await.unwrap();
    let welcome = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(welcome.payload.as_text(), Some("Welcome!"));
    assert!(runtime.events().wait_idle(Duration::from_secs(2)).await);
    let moved = runtime.dialog().sessions().get(&session_id).await.unwrap().unwrap();
    assert_eq!(moved.position(), Some(("main", "adult")));
    runtime.shutdown().await;
}

#[tokio::test]
async fn create_id_depends_only_on_the_conversation() {
    let a = to_c1("hi");
    let mut b = Event::incoming(
        EventDestination::new("webchat", "demo", "c1", "someone-else"),
        EventPayload::text("different text"),
    );
    b.flags.set(WellKnownFlag::SkipStore, true);
    assert_eq!(DialogEngine::create_id(&a), DialogEngine::create_id(&a));
    assert_eq!(DialogEngine::create_id(&a), DialogEngine::create_id(&b));

    for other in [
        EventDestination::new("telegram", "demo", "c1", "u1"),
        EventDestination::new("webchat", "other", "c1", "u1"),
        EventDestination::new("webchat", "demo", "c2", "u1"),
    ] {
        let event = Event::incoming(other, EventPayload::text("hi"));
        assert_ne!(DialogEngine::create_id(&a), DialogEngine::create_id(&event));
    }
}

#[tokio::test]
async fn skip_flag_and_jump_to_through_runtime() {
    let support = Flow::new("support", "ask").with_node("ask", node(vec![say("Support here.")], vec![]));
    let (runtime, mut rx) = runtime(vec![age_flow(), support]).await;

    let mut skipped = to_c1("hi");
    skipped.flags.set(WellKnownFlag::SkipDialogEngine, true);
    let session_id = DialogEngine::create_id(&skipped);
    runtime.events().send_event(skipped).await.unwrap();
    assert!(runtime.events().wait_idle(Duration::from_secs(2)).await);
    assert!(rx.try_recv().is_err());
    assert!(runtime.dialog().sessions().get(&session_id).await.unwrap().is_none());

    let event = to_c1("help");
    assert!(matches!(
        runtime.dialog().jump_to(&session_id, &event, "billing", None).await,
        Err(DialogError::UnknownFlow { .. })
    ));
    let ids = runtime.dialog().jump_to(&session_id, &event, "support", None).await.unwrap();
    assert_eq!(ids.len(), 1);
    let reply = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply.payload.as_text(), Some("Support here."));

    runtime.dialog().delete_session(&session_id, "demo").await.unwrap();
    assert!(runtime.dialog().sessions().get(&session_id).await.unwrap().is_none());
    runtime.shutdown().await;
}
