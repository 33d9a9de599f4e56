//! Babyphone IPC
//!
//! Transport-neutral event types, the outbound `Responder` capability,
//! and the event bus between the chat adapter and the dispatcher

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

/// One inbound chat event, already stripped of transport details.
///
/// `sender_id` identifies the user, `session_id` the chat. Authorization is
/// keyed on the chat, the user id is only carried for audit logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Command {
        sender_id: i64,
        session_id: i64,
        text: String,
        message_id: Option<i64>,
    },
    Callback {
        sender_id: i64,
        session_id: i64,
        data: String,
        /// Message hosting the inline keyboard that produced this callback.
        prompt_message_id: i64,
        query_id: String,
    },
}

impl InboundEvent {
    pub fn command(sender_id: i64, session_id: i64, text: impl Into<String>) -> Self {
        InboundEvent::Command {
            sender_id,
            session_id,
            text: text.into(),
            message_id: None,
        }
    }

    pub fn callback(
        sender_id: i64,
        session_id: i64,
        data: impl Into<String>,
        prompt_message_id: i64,
    ) -> Self {
        InboundEvent::Callback {
            sender_id,
            session_id,
            data: data.into(),
            prompt_message_id,
            query_id: String::new(),
        }
    }

    pub fn sender_id(&self) -> i64 {
        match self {
            InboundEvent::Command { sender_id, .. } | InboundEvent::Callback { sender_id, .. } => {
                *sender_id
            }
        }
    }

    pub fn session_id(&self) -> i64 {
        match self {
            InboundEvent::Command { session_id, .. }
            | InboundEvent::Callback { session_id, .. } => *session_id,
        }
    }

    /// Raw text of a command or raw data of a callback.
    pub fn raw(&self) -> &str {
        match self {
            InboundEvent::Command { text, .. } => text,
            InboundEvent::Callback { data, .. } => data,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Command { .. } => "command",
            InboundEvent::Callback { .. } => "callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Keyboard attached to an outbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    /// Persistent reply keyboard; pressing a key sends its label as text.
    Keyboard(Vec<Vec<String>>),
    /// Buttons under the message; pressing one produces a callback.
    Inline(Vec<Vec<InlineButton>>),
}

/// Outbound capability the dispatch core needs from the chat transport.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, markup: Option<Markup>) -> Result<()>;

    async fn send_photo(&self, chat_id: i64, image: Vec<u8>) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub trace_id: String,
    pub channel: String,
    pub event: InboundEvent,
}

impl Envelope {
    pub fn new(channel: &str, event: InboundEvent) -> Self {
        Self {
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            event,
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_trace_id() {
        let env = Envelope::new("telegram", InboundEvent::command(1, 2, "/help"));
        assert!(env.trace_id.starts_with("trace-"));
    }

    #[test]
    fn trace_id_different_for_each_envelope() {
        let env1 = Envelope::new("telegram", InboundEvent::command(1, 2, "/help"));
        let env2 = Envelope::new("telegram", InboundEvent::command(1, 2, "/help"));
        assert_ne!(env1.trace_id, env2.trace_id);
    }

    #[test]
    fn accessors_cover_both_variants() {
        let cmd = InboundEvent::command(55, 900, "/start 4821");
        assert_eq!(cmd.sender_id(), 55);
        assert_eq!(cmd.session_id(), 900);
        assert_eq!(cmd.raw(), "/start 4821");
        assert_eq!(cmd.kind(), "command");

        let cb = InboundEvent::callback(55, 900, "confirm_reboot", 42);
        assert_eq!(cb.session_id(), 900);
        assert_eq!(cb.raw(), "confirm_reboot");
        assert_eq!(cb.kind(), "callback");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(InboundEvent::callback(1, 2, "abort_shutdown", 3))
            .expect("serialize");
        assert_eq!(json["type"], "callback");
        assert_eq!(json["prompt_message_id"], 3);
    }

    #[tokio::test]
    async fn published_event_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Envelope::new("telegram", InboundEvent::command(1, 2, "x")))
            .expect("publish");
        let received = rx.recv().await.expect("recv");
        assert_eq!(received.event.raw(), "x");
    }

    #[test]
    fn publish_without_subscriber_fails() {
        let bus = EventBus::new();
        assert!(bus
            .publish(Envelope::new("telegram", InboundEvent::command(1, 2, "x")))
            .is_err());
    }
}
