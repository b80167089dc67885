//! Domain-partitioned reactive state store.
//!
//! The store is the single source of truth for everything mirrored from
//! the server. State is split into named domains (`transport`, `devices`,
//! `chat`, `timeline`, `session`); the only mutation path is a typed
//! shallow-merge patch, and every applied patch synchronously notifies all
//! subscribers with the fully-merged snapshot — a subscriber never
//! observes a partially-applied write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use jamroom_shared::{
    ChatMessage, Clip, Device, LoopRegion, SessionInfo, TimeSignature, TransportState,
};

// --- Client-side entry types ---

/// A chat message as held in the store. Unlike the wire model it carries
/// the temporary-entry marker used by optimistic sends.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChatMessage {
    pub id: String,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_temp: bool,
}

impl From<ChatMessage> for StoredChatMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            id: msg.id,
            author: msg.author,
            body: msg.body,
            sent_at: msg.sent_at,
            is_temp: false,
        }
    }
}

/// A timeline clip as held in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredClip {
    pub id: String,
    pub name: String,
    pub start_beat: f64,
    pub length_beats: f64,
    pub order: u32,
    pub is_temp: bool,
}

impl From<Clip> for StoredClip {
    fn from(clip: Clip) -> Self {
        Self {
            id: clip.id,
            name: clip.name,
            start_beat: clip.start_beat,
            length_beats: clip.length_beats,
            order: clip.order,
            is_temp: false,
        }
    }
}

// --- Domains ---

#[derive(Debug, Clone, PartialEq)]
pub struct TransportDomain {
    pub is_playing: bool,
    pub position_beats: f64,
    pub bpm: f64,
    pub time_signature: TimeSignature,
    pub loop_enabled: bool,
    pub loop_region: Option<LoopRegion>,
    pub error: Option<String>,
}

impl Default for TransportDomain {
    fn default() -> Self {
        let state = TransportState::default();
        Self {
            is_playing: state.is_playing,
            position_beats: state.position_beats,
            bpm: state.bpm,
            time_signature: state.time_signature,
            loop_enabled: state.loop_enabled,
            loop_region: state.loop_region,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicesDomain {
    pub devices: Vec<Device>,
    pub scanning: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDomain {
    /// All messages, sorted by `sent_at` ascending.
    pub messages: Vec<StoredChatMessage>,
    /// Whether the history has been fetched from the REST API.
    pub loaded: bool,
    pub error: Option<String>,
}

impl ChatDomain {
    /// Add a message, maintaining sort order by `sent_at`.
    /// Returns false if a message with the same id already exists.
    pub fn insert_message(&mut self, msg: StoredChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == msg.id) {
            return false;
        }
        let pos = self
            .messages
            .binary_search_by(|m| m.sent_at.cmp(&msg.sent_at))
            .unwrap_or_else(|pos| pos);
        self.messages.insert(pos, msg);
        true
    }

    /// Replace the full history (from a REST fetch) and mark it loaded.
    pub fn set_history(&mut self, mut messages: Vec<StoredChatMessage>) {
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        self.messages = messages;
        self.loaded = true;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineDomain {
    /// All clips, sorted by `order` ascending.
    pub clips: Vec<StoredClip>,
    pub loaded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDomain {
    pub session: Option<SessionInfo>,
    pub error: Option<String>,
}

/// Full state snapshot across all domains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    pub transport: TransportDomain,
    pub devices: DevicesDomain,
    pub chat: ChatDomain,
    pub timeline: TimelineDomain,
    pub session: SessionDomain,
}

// --- Patches ---
//
// A patch field of `None` preserves the current value; `Some` overwrites
// it. Fields that are themselves optional in the domain use a nested
// `Option` so they can be explicitly cleared.

#[derive(Debug, Clone, Default)]
pub struct TransportPatch {
    pub is_playing: Option<bool>,
    pub position_beats: Option<f64>,
    pub bpm: Option<f64>,
    pub time_signature: Option<TimeSignature>,
    pub loop_enabled: Option<bool>,
    pub loop_region: Option<Option<LoopRegion>>,
    pub error: Option<Option<String>>,
}

impl TransportPatch {
    /// Patch carrying every field of an authoritative transport state.
    pub fn from_state(state: &TransportState) -> Self {
        Self {
            is_playing: Some(state.is_playing),
            position_beats: Some(state.position_beats),
            bpm: Some(state.bpm),
            time_signature: Some(state.time_signature),
            loop_enabled: Some(state.loop_enabled),
            loop_region: Some(state.loop_region),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DevicesPatch {
    pub devices: Option<Vec<Device>>,
    pub scanning: Option<bool>,
    pub error: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatPatch {
    pub messages: Option<Vec<StoredChatMessage>>,
    pub loaded: Option<bool>,
    pub error: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct TimelinePatch {
    pub clips: Option<Vec<StoredClip>>,
    pub loaded: Option<bool>,
    pub error: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub session: Option<Option<SessionInfo>>,
    pub error: Option<Option<String>>,
}

/// A shallow-merge patch targeting one domain.
#[derive(Debug, Clone)]
pub enum StatePatch {
    Transport(TransportPatch),
    Devices(DevicesPatch),
    Chat(ChatPatch),
    Timeline(TimelinePatch),
    Session(SessionPatch),
}

fn merge(state: &mut AppState, patch: StatePatch) {
    match patch {
        StatePatch::Transport(p) => {
            let d = &mut state.transport;
            if let Some(v) = p.is_playing {
                d.is_playing = v;
            }
            if let Some(v) = p.position_beats {
                d.position_beats = v;
            }
            if let Some(v) = p.bpm {
                d.bpm = v;
            }
            if let Some(v) = p.time_signature {
                d.time_signature = v;
            }
            if let Some(v) = p.loop_enabled {
                d.loop_enabled = v;
            }
            if let Some(v) = p.loop_region {
                d.loop_region = v;
            }
            if let Some(v) = p.error {
                d.error = v;
            }
        }
        StatePatch::Devices(p) => {
            let d = &mut state.devices;
            if let Some(v) = p.devices {
                d.devices = v;
            }
            if let Some(v) = p.scanning {
                d.scanning = v;
            }
            if let Some(v) = p.error {
                d.error = v;
            }
        }
        StatePatch::Chat(p) => {
            let d = &mut state.chat;
            if let Some(v) = p.messages {
                d.messages = v;
            }
            if let Some(v) = p.loaded {
                d.loaded = v;
            }
            if let Some(v) = p.error {
                d.error = v;
            }
        }
        StatePatch::Timeline(p) => {
            let d = &mut state.timeline;
            if let Some(v) = p.clips {
                d.clips = v;
            }
            if let Some(v) = p.loaded {
                d.loaded = v;
            }
            if let Some(v) = p.error {
                d.error = v;
            }
        }
        StatePatch::Session(p) => {
            let d = &mut state.session;
            if let Some(v) = p.session {
                d.session = v;
            }
            if let Some(v) = p.error {
                d.error = v;
            }
        }
    }
}

// --- Store ---

type Subscriber = Arc<dyn Fn(&AppState) + Send + Sync>;
type SubscriberList = Mutex<Vec<(u64, Subscriber)>>;

/// Reactive store handle. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<AppState>,
    subscribers: SubscriberList,
    next_id: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current full snapshot across all domains.
    pub fn snapshot(&self) -> AppState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Merge a patch into its domain and notify every subscriber with the
    /// merged snapshot.
    pub fn apply(&self, patch: StatePatch) -> AppState {
        self.apply_with(move |_| patch)
    }

    /// Compute a patch from the current state and apply it in one step.
    /// The closure runs under the state lock, so read-modify-write updates
    /// (e.g. inserting into a collection) cannot interleave.
    pub fn apply_with(&self, f: impl FnOnce(&AppState) -> StatePatch) -> AppState {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let patch = f(&state);
            merge(&mut state, patch);
            state.clone()
        };
        let subscribers: Vec<Subscriber> = {
            let subs = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subs.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in subscribers {
            cb(&snapshot);
        }
        snapshot
    }

    /// Register a callback invoked with the full snapshot on every applied
    /// patch. The returned handle must be used to unsubscribe; dropping it
    /// leaves the subscription active.
    pub fn subscribe(
        &self,
        callback: impl Fn(&AppState) + Send + Sync + 'static,
    ) -> StoreSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        StoreSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Handle for removing a store subscription.
pub struct StoreSubscription {
    id: u64,
    inner: Weak<StoreInner>,
}

impl StoreSubscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}
