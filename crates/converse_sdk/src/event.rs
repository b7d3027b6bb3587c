use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};

/// The unit of work flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Event {
    pub id: String,                          // UUID, assigned at creation
    pub direction: EventDirection,           // Incoming or Outgoing
    pub destination: EventDestination,       // Conversational target
    pub payload: EventPayload,               // Text, postback, ...
    #[serde(default)]
    pub flags: EventFlags,                   // Markers set by middleware
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,           // Groups request/response pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_event_id: Option<String>,   // Set on replies
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state: HashMap<String, Value>,       // Scratch space for middleware
}

impl Event {
    pub fn new(direction: EventDirection, destination: EventDestination, payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            destination,
            payload,
            flags: EventFlags::default(),
            created_at: Utc::now(),
            thread_id: None,
            incoming_event_id: None,
            state: HashMap::new(),
        }
    }

    pub fn incoming(destination: EventDestination, payload: EventPayload) -> Self {
        Self::new(EventDirection::Incoming, destination, payload)
    }

    pub fn outgoing(destination: EventDestination, payload: EventPayload) -> Self {
        Self::new(EventDirection::Outgoing, destination, payload)
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Marks this event as a reply to `incoming_event_id`.
    pub fn in_reply_to(mut self, incoming_event_id: impl Into<String>) -> Self {
        self.incoming_event_id = Some(incoming_event_id.into());
        self
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == EventDirection::Incoming
    }

    /// Key shared by every event of the same conversation.
    pub fn conversation_key(&self) -> String {
        self.destination.conversation_key()
    }

    pub fn bot_id(&self) -> &str {
        &self.destination.bot_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventDirection {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub struct EventDestination {
    pub channel: String,         // webchat, telegram, ...
    pub bot_id: String,
    pub conversation_id: String,
    pub user_id: String,
}

impl EventDestination {
    pub fn new(
        channel: impl Into<String>,
        bot_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            bot_id: bot_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Length-prefixed `bot`, `channel` and `conversation`, so no choice of
    /// separators inside the ids can make two conversations share a key.
    pub fn conversation_key(&self) -> String {
        [&self.bot_id, &self.channel, &self.conversation_id]
            .iter()
            .map(|part| format!("{}:{part}", part.len()))
            .collect()
    }
}

/// Closed set of payload kinds understood by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Text { text: String },
    Postback { payload: Value },
    QuickReply { text: String, payload: Value },
    Custom { kind: String, data: Value },
}

impl EventPayload {
    pub fn text(text: impl Into<String>) -> Self {
        EventPayload::Text { text: text.into() }
    }

    pub fn kind(&self) -> &str {
        match self {
            EventPayload::Text { .. } => "text",
            EventPayload::Postback { .. } => "postback",
            EventPayload::QuickReply { .. } => "quick_reply",
            EventPayload::Custom { kind, .. } => kind,
        }
    }

    /// The human readable text carried by this payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EventPayload::Text { text } | EventPayload::QuickReply { text, .. } => Some(text),
            EventPayload::Postback { .. } | EventPayload::Custom { .. } => None,
        }
    }
}

/// Markers the runtime itself understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum WellKnownFlag {
    SkipDialogEngine,
    AlreadyReplied,
    UndergoingNlu,
    SkipStore,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct EventFlags {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_dialog_engine: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_replied: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub undergoing_nlu: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_store: bool,
    /// Plugin defined markers.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub custom: BTreeSet<String>,
}

impl EventFlags {
    pub fn set(&mut self, flag: WellKnownFlag, value: bool) {
        *self.slot(flag) = value;
    }

    pub fn has(&self, flag: WellKnownFlag) -> bool {
        match flag {
            WellKnownFlag::SkipDialogEngine => self.skip_dialog_engine,
            WellKnownFlag::AlreadyReplied => self.already_replied,
            WellKnownFlag::UndergoingNlu => self.undergoing_nlu,
            WellKnownFlag::SkipStore => self.skip_store,
        }
    }

    pub fn set_custom(&mut self, flag: impl Into<String>) {
        self.custom.insert(flag.into());
    }

    pub fn has_custom(&self, flag: &str) -> bool {
        self.custom.contains(flag)
    }

    fn slot(&mut self, flag: WellKnownFlag) -> &mut bool {
        match flag {
            WellKnownFlag::SkipDialogEngine => &mut self.skip_dialog_engine,
            WellKnownFlag::AlreadyReplied => &mut self.already_replied,
            WellKnownFlag::UndergoingNlu => &mut self.undergoing_nlu,
            WellKnownFlag::SkipStore => &mut self.skip_store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn destination() -> EventDestination {
        EventDestination::new("webchat", "demo", "c1", "u1")
    }

    #[test]
    fn test_event_creation() {
        let event = Event::incoming(destination(), EventPayload::text("hello"));
        assert!(event.is_incoming());
        assert_eq!(event.payload.as_text(), Some("hello"));
        assert_eq!(event.conversation_key(), "4:demo7:webchat2:c1");
        assert!(uuid::Uuid::parse_str(&event.id).is_ok());
    }

    #[test]
    fn test_conversation_key_ignores_separators_in_ids() {
        let a = EventDestination::new("chat", "web::", ":c1", "u1");
        let b = EventDestination::new("::chat", "web", "c1", "u1");
        let c = EventDestination::new("chat", "web", "::c1", "u1");
        assert_ne!(a.conversation_key(), b.conversation_key());
        assert_ne!(a.conversation_key(), c.conversation_key());
        assert_ne!(b.conversation_key(), c.conversation_key());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Event::incoming(destination(), EventPayload::text("a"));
        let b = Event::incoming(destination(), EventPayload::text("a"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = EventPayload::Postback { payload: json!({"choice": 2}) };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"type": "postback", "payload": {"choice": 2}}));
        assert_eq!(payload.kind(), "postback");
        assert_eq!(payload.as_text(), None);
    }

    #[test]
    fn test_every_flag_roundtrips_through_set_and_has() {
        let mut flags = EventFlags::default();
        for flag in WellKnownFlag::iter() {
            assert!(!flags.has(flag));
            flags.set(flag, true);
            assert!(flags.has(flag), "flag {flag} not set");
        }
        flags.set(WellKnownFlag::AlreadyReplied, false);
        assert!(!flags.already_replied);
    }

    #[test]
    fn test_flag_names_parse() {
        assert_eq!(
            WellKnownFlag::from_str("skip_dialog_engine").unwrap(),
            WellKnownFlag::SkipDialogEngine
        );
        assert!(WellKnownFlag::from_str("nope").is_err());
    }

    #[test]
    fn test_default_flags_are_omitted_from_json() {
        let event = Event::outgoing(destination(), EventPayload::text("x"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["flags"], json!({}));
        assert!(value.get("thread_id").is_none());
    }
}
