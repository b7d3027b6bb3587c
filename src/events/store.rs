use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use converse_sdk::Event;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::Display;
use tracing::warn;

use super::EventError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    ShortCircuited,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Feedback {
    pub target: String,
    pub score: i32,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// An event plus what the pipeline did with it.
///
/// The event fields are flattened so predicates address them directly
/// (`destination.conversation_id`, `direction`, `status`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: Event,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub processed_by: Vec<String>,
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    pub updated_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn pending(event: Event) -> Self {
        Self {
            event,
            status: EventStatus::Pending,
            error: None,
            processed_by: vec![],
            feedback: vec![],
            updated_at: Utc::now(),
        }
    }

    fn matches(&self, fields: &Map<String, Value>) -> bool {
        if fields.is_empty() {
            return true;
        }
        let Ok(doc) = serde_json::to_value(self) else {
            return false;
        };
        fields
            .iter()
            .all(|(path, expected)| doc.pointer(&pointer(path)) == Some(expected))
    }
}

/// Field-level difference between two versions of an event. Paths are kept
/// as segments so state keys containing dots stay addressable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventChanges {
    set: Vec<(Vec<String>, Value)>,
    removed: Vec<Vec<String>>,
}

impl EventChanges {
    pub fn between(before: &Event, after: &Event) -> Result<Self, EventError> {
        let before = serde_json::to_value(before).map_err(|e| EventError::Store(e.to_string()))?;
        let after = serde_json::to_value(after).map_err(|e| EventError::Store(e.to_string()))?;
        let mut changes = Self::default();
        changes.diff(&mut Vec::new(), &before, &after);
        Ok(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Changed paths in dotted form, for logging.
    pub fn paths(&self) -> Vec<String> {
        self.set
            .iter()
            .map(|(path, _)| path)
            .chain(self.removed.iter())
            .map(|path| path.join("."))
            .collect()
    }

    fn diff(&mut self, path: &mut Vec<String>, before: &Value, after: &Value) {
        match (before, after) {
            (Value::Object(old), Value::Object(new)) => {
                for (key, value) in new {
                    if path.is_empty() && key == "id" {
                        continue;
                    }
                    path.push(key.clone());
                    match old.get(key) {
                        Some(previous) => self.diff(path, previous, value),
                        None if value.is_object() => self.diff(path, &Value::Object(Map::new()), value),
                        None => self.set.push((path.clone(), value.clone())),
                    }
                    path.pop();
                }
                for (key, value) in old.iter().filter(|(key, _)| !new.contains_key(*key)) {
                    path.push(key.clone());
                    if value.is_object() {
                        self.diff(path, value, &Value::Object(Map::new()));
                    } else {
                        self.removed.push(path.clone());
                    }
                    path.pop();
                }
            }
            _ if before != after && !path.is_empty() => self.set.push((path.clone(), after.clone())),
            _ => {}
        }
    }

    fn apply(&self, doc: &mut Value) {
        for path in &self.removed {
            remove_segments(doc, path);
        }
        for (path, value) in &self.set {
            set_segments(doc, path, value.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct SearchParams {
    /// Dotted field path; defaults to `created_at`.
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl SearchParams {
    pub fn sorted_by(field: impl Into<String>) -> Self {
        Self {
            sort_by: Some(field.into()),
            ..Default::default()
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn apply(&self, mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        match self.sort_by.as_deref() {
            None | Some("created_at") => events.sort_by(|a, b| {
                a.event
                    .created_at
                    .cmp(&b.event.created_at)
                    .then_with(|| a.event.id.cmp(&b.event.id))
            }),
            Some("updated_at") => events.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
            Some(field) => {
                let path = pointer(field);
                let mut keyed: Vec<(Value, StoredEvent)> = events
                    .into_iter()
                    .map(|e| {
                        let key = serde_json::to_value(&e)
                            .ok()
                            .and_then(|doc| doc.pointer(&path).cloned())
                            .unwrap_or(Value::Null);
                        (key, e)
                    })
                    .collect();
                keyed.sort_by(|(a, _), (b, _)| compare_values(a, b));
                events = keyed.into_iter().map(|(_, e)| e).collect();
            }
        }
        if self.descending {
            events.reverse();
        }
        events
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Durable log of events keyed by id.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists a freshly submitted event as `Pending`.
    async fn insert(&self, event: &Event) -> Result<(), EventError>;
    async fn get(&self, id: &str) -> Result<Option<StoredEvent>, EventError>;
    async fn find(&self, fields: &Map<String, Value>, params: &SearchParams) -> Result<Vec<StoredEvent>, EventError>;
    /// Writes dotted field paths into a stored event. `id` is immutable.
    async fn update(&self, id: &str, fields: &Map<String, Value>) -> Result<StoredEvent, EventError>;
    async fn set_status(&self, id: &str, status: EventStatus) -> Result<(), EventError>;
    /// Applies what the chain changed on the event and its final status.
    /// Fields the chain left alone keep whatever was stored meanwhile.
    async fn record_outcome(
        &self,
        id: &str,
        changes: &EventChanges,
        status: EventStatus,
        error: Option<String>,
        processed_by: Vec<String>,
    ) -> Result<(), EventError>;
    async fn add_feedback(&self, id: &str, feedback: Feedback) -> Result<(), EventError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: DashMap<String, StoredEvent>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, event: &Event) -> Result<(), EventError> {
        self.events
            .insert(event.id.clone(), StoredEvent::pending(event.clone()));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredEvent>, EventError> {
        Ok(self.events.get(id).map(|e| e.clone()))
    }

    async fn find(&self, fields: &Map<String, Value>, params: &SearchParams) -> Result<Vec<StoredEvent>, EventError> {
        let hits = self
            .events
            .iter()
            .filter(|e| e.matches(fields))
            .map(|e| e.clone())
            .collect();
        Ok(params.apply(hits))
    }

    async fn update(&self, id: &str, fields: &Map<String, Value>) -> Result<StoredEvent, EventError> {
        let mut entry = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventError::NotFound(id.to_string()))?;

        let mut doc = serde_json::to_value(&*entry).map_err(|e| EventError::Store(e.to_string()))?;
        for (path, value) in fields {
            if path == "id" {
                warn!(event_id = id, "ignoring attempt to rewrite an event id");
                continue;
            }
            set_path(&mut doc, path, value.clone());
        }
        let mut updated: StoredEvent =
            serde_json::from_value(doc).map_err(|e| EventError::Store(format!("invalid update of `{id}`: {e}")))?;
        updated.updated_at = Utc::now();
        *entry = updated.clone();
        Ok(updated)
    }

    async fn set_status(&self, id: &str, status: EventStatus) -> Result<(), EventError> {
        let mut entry = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventError::NotFound(id.to_string()))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: &str,
        changes: &EventChanges,
        status: EventStatus,
        error: Option<String>,
        processed_by: Vec<String>,
    ) -> Result<(), EventError> {
        let mut entry = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventError::NotFound(id.to_string()))?;
        if !changes.is_empty() {
            let mut doc = serde_json::to_value(&*entry).map_err(|e| EventError::Store(e.to_string()))?;
            changes.apply(&mut doc);
            *entry = serde_json::from_value(doc)
                .map_err(|e| EventError::Store(format!("invalid outcome for `{id}`: {e}")))?;
        }
        entry.status = status;
        entry.error = error;
        entry.processed_by = processed_by;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn add_feedback(&self, id: &str, feedback: Feedback) -> Result<(), EventError> {
        let mut entry = self
            .events
            .get_mut(id)
            .ok_or_else(|| EventError::NotFound(id.to_string()))?;
        entry.feedback.push(feedback);
        entry.updated_at = Utc::now();
        Ok(())
    }
}

fn pointer(path: &str) -> String {
    format!("/{}", path.replace('.', "/"))
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    set_segments(doc, &segments, value);
}

fn set_segments(doc: &mut Value, path: &[String], value: Value) {
    let mut current = doc;
    let mut segments = path.iter().peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.clone(), value);
            return;
        }
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_segments(doc: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = doc;
    for segment in parents {
        match current.get_mut(segment.as_str()) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(last);
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converse_sdk::{EventDestination, EventPayload};
    use serde_json::json;

    fn event(conversation: &str, text: &str) -> Event {
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

    #[tokio::test]
    async fn test_find_by_nested_field() {
        let store = InMemoryEventStore::new();
        store.insert(&event("c1", "a")).await.unwrap();
        store.insert(&event("c2", "b")).await.unwrap();
        store.insert(&event("c1", "c")).await.unwrap();

        let hits = store
            .find(&fields(json!({"destination.conversation_id": "c1"})), &SearchParams::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.event.destination.conversation_id == "c1"));
        assert!(hits.iter().all(|e| e.status == EventStatus::Pending));
    }

    #[tokio::test]
    async fn test_sort_and_page() {
        let store = InMemoryEventStore::new();
        for text in ["b", "a", "c"] {
            store.insert(&event("c1", text)).await.unwrap();
        }
        let params = SearchParams::sorted_by("payload.text").descending().limit(2);
        let hits = store.find(&Map::new(), &params).await.unwrap();
        let texts: Vec<_> = hits.iter().filter_map(|e| e.event.payload.as_text()).collect();
        assert_eq!(texts, vec!["c", "b"]);

        let params = SearchParams::sorted_by("payload.text").offset(2);
        let hits = store.find(&Map::new(), &params).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event.payload.as_text(), Some("c"));
    }

    #[tokio::test]
    async fn test_update_writes_fields_and_keeps_id() {
        let store = InMemoryEventStore::new();
        let e = event("c1", "hello");
        store.insert(&e).await.unwrap();

        let updated = store
            .update(
                &e.id,
                &fields(json!({"id": "other", "state.topic": "billing", "status": "completed"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.event.id, e.id);
        assert_eq!(updated.event.state.get("topic"), Some(&json!("billing")));
        assert_eq!(updated.status, EventStatus::Completed);
        assert_eq!(store.get(&e.id).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_values() {
        let store = InMemoryEventStore::new();
        let e = event("c1", "hello");
        store.insert(&e).await.unwrap();
        let err = store
            .update(&e.id, &fields(json!({"status": "sideways"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Store(_)));
        assert_eq!(store.get(&e.id).await.unwrap().unwrap().status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_event_is_not_found() {
        let store = InMemoryEventStore::new();
        let err = store.update("nope", &Map::new()).await.unwrap_err();
        assert!(matches!(err, EventError::NotFound(id) if id == "nope"));
        let feedback = Feedback {
            target: "u1".into(),
            score: 1,
            kind: "qna".into(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.add_feedback("nope", feedback).await,
            Err(EventError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_outcome_keeps_feedback() {
        let store = InMemoryEventStore::new();
        let mut e = event("c1", "hello");
        store.insert(&e).await.unwrap();
        store
            .add_feedback(
                &e.id,
                Feedback {
                    target: "u1".into(),
                    score: -1,
                    kind: "qna".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let before = e.clone();
        e.state.insert("seen".into(), json!(true));
        let changes = EventChanges::between(&before, &e).unwrap();
        store
            .record_outcome(&e.id, &changes, EventStatus::Completed, None, vec!["audit".into()])
            .await
            .unwrap();

        let stored = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
        assert_eq!(stored.processed_by, vec!["audit".to_string()]);
        assert_eq!(stored.feedback.len(), 1);
        assert_eq!(stored.event.state.get("seen"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_record_outcome_merges_with_concurrent_update() {
        let store = InMemoryEventStore::new();
        let mut e = event("c1", "hello");
        e.state.insert("lang".into(), json!("fr"));
        e.state.insert("scratch".into(), json!(1));
        store.insert(&e).await.unwrap();
        let before = e.clone();

        // written by someone else while the chain runs
        store
            .update(&e.id, &fields(json!({"state.topic": "billing", "state.lang": "de"})))
            .await
            .unwrap();

        e.state.insert("lang".into(), json!("en"));
        e.state.remove("scratch");
        e.state.insert("a.b".into(), json!("dotted"));
        e.flags.set_custom("tagged");
        let changes = EventChanges::between(&before, &e).unwrap();
        assert!(!changes.is_empty());
        store
            .record_outcome(&e.id, &changes, EventStatus::Completed, None, vec![])
            .await
            .unwrap();

        let stored = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.event.state.get("topic"), Some(&json!("billing")));
        assert_eq!(stored.event.state.get("lang"), Some(&json!("en")));
        assert_eq!(stored.event.state.get("a.b"), Some(&json!("dotted")));
        assert!(!stored.event.state.contains_key("scratch"));
        assert!(stored.event.flags.has_custom("tagged"));
        assert_eq!(stored.event.payload.as_text(), Some("hello"));
    }

    #[test]
    fn test_unchanged_event_has_no_changes() {
        let mut e = event("c1", "hello");
        let same = e.clone();
        assert!(EventChanges::between(&same, &e).unwrap().is_empty());
        e.id = "renamed".into();
        assert!(EventChanges::between(&same, &e).unwrap().is_empty());
        e.payload = EventPayload::text("changed");
        assert_eq!(EventChanges::between(&same, &e).unwrap().paths(), vec!["payload.text"]);
    }
}
