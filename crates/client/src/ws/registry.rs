//! Typed publish/subscribe registry for push-channel messages.
//!
//! Handlers are keyed by topic tag. A topic's entry is created on first
//! subscribe and removed when its last handler unsubscribes. Handler
//! panics are isolated: one panicking subscriber is logged and the rest
//! still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::warn;

use jamroom_shared::{TOPIC_CHAT, TOPIC_DEVICES, TOPIC_TIMELINE, TOPIC_TRANSPORT};

/// Message-type tags the registry dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Transport,
    Devices,
    Chat,
    Timeline,
    /// Connection status transitions (client-local, never on the wire).
    Status,
    /// A frame that failed to decode as an envelope.
    MessageError,
    /// A decoded envelope whose `type` field was absent.
    Untyped,
    /// Any tag this client has no dedicated variant for.
    Other(String),
}

impl Topic {
    pub fn parse(tag: &str) -> Self {
        match tag {
            TOPIC_TRANSPORT => Topic::Transport,
            TOPIC_DEVICES => Topic::Devices,
            TOPIC_CHAT => Topic::Chat,
            TOPIC_TIMELINE => Topic::Timeline,
            "status" => Topic::Status,
            "message_error" => Topic::MessageError,
            "untyped_message" => Topic::Untyped,
            other => Topic::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Transport => TOPIC_TRANSPORT,
            Topic::Devices => TOPIC_DEVICES,
            Topic::Chat => TOPIC_CHAT,
            Topic::Timeline => TOPIC_TIMELINE,
            Topic::Status => "status",
            Topic::MessageError => "message_error",
            Topic::Untyped => "untyped_message",
            Topic::Other(tag) => tag,
        }
    }
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
type HandlerMap = HashMap<Topic, Vec<(u64, Handler)>>;

#[derive(Clone, Default)]
pub struct Registry {
    handlers: Arc<Mutex<HandlerMap>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic. The returned handle must be used to
    /// unsubscribe; dropping it leaves the subscription active.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            topic,
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Invoke every handler registered for a topic. No ordering guarantee
    /// across handlers.
    pub fn publish(&self, topic: &Topic, payload: &Value) {
        let list: Vec<Handler> = {
            let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(topic)
                .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in list {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                warn!(topic = topic.as_str(), "subscriber panicked while handling message");
            }
        }
    }

    /// Number of handlers registered for a topic.
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn has_entry(&self, topic: &Topic) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(topic)
    }
}

/// Handle for removing a registered handler.
pub struct Subscription {
    topic: Topic,
    id: u64,
    handlers: Weak<Mutex<HandlerMap>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut map = handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = map.get_mut(&self.topic) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                map.remove(&self.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parse_maps_known_tags_and_keeps_unknown_ones() {
        assert_eq!(Topic::parse("transport"), Topic::Transport);
        assert_eq!(Topic::parse("untyped_message"), Topic::Untyped);
        assert_eq!(Topic::parse("tuning"), Topic::Other("tuning".to_string()));
        assert_eq!(Topic::parse("tuning").as_str(), "tuning");
    }

    #[test]
    fn publish_reaches_every_handler_for_the_topic() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _a = registry.subscribe(Topic::Chat, {
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _b = registry.subscribe(Topic::Chat, {
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _other = registry.subscribe(Topic::Devices, {
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            }
        });

        registry.publish(&Topic::Chat, &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_starve_the_rest() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = registry.subscribe(Topic::Chat, |_| panic!("bad handler"));
        let _good = registry.subscribe(Topic::Chat, {
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.publish(&Topic::Chat, &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_handler_and_empty_topic_entry() {
        let registry = Registry::new();
        let sub_a = registry.subscribe(Topic::Chat, |_| {});
        let sub_b = registry.subscribe(Topic::Chat, |_| {});
        assert_eq!(registry.handler_count(&Topic::Chat), 2);

        sub_a.unsubscribe();
        assert_eq!(registry.handler_count(&Topic::Chat), 1);
        assert!(registry.has_entry(&Topic::Chat));

        sub_b.unsubscribe();
        assert_eq!(registry.handler_count(&Topic::Chat), 0);
        assert!(!registry.has_entry(&Topic::Chat));
    }
}
