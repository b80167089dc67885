//! Assembled client: connection + store + commands with one lifecycle.

use std::sync::Mutex;

use tracing::warn;

use jamroom_shared::{ChatMessage, Clip, Device, TransportUpdate};

use crate::api_client::ApiClient;
use crate::commands::Commands;
use crate::config::ClientConfig;
use crate::scope::Scope;
use crate::store::{
    ChatPatch, DevicesPatch, StatePatch, Store, StoredChatMessage, StoredClip, TimelinePatch,
    TransportPatch,
};
use crate::ws::connection::Connection;
use crate::ws::registry::{Subscription, Topic};

/// Handle to one synchronized session. Explicitly constructed and
/// injectable — consumers receive this value rather than importing a
/// shared instance.
pub struct Client {
    config: ClientConfig,
    store: Store,
    connection: Connection,
    commands: Commands,
    scope: Scope,
    push_subs: Mutex<Vec<Subscription>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let store = Store::new();
        let api = ApiClient::new()
            .with_base_url(config.server_url.clone())
            .with_bearer(config.token.clone());
        let token = config.token.clone();
        let connection = Connection::new(config.ws_url(), config.reconnect.clone(), move || {
            token.clone()
        });
        let commands = Commands::new(api, store.clone(), config.commands.clone());
        Self {
            config,
            store,
            connection,
            commands,
            scope: Scope::new(),
            push_subs: Mutex::new(Vec::new()),
        }
    }

    /// Wire push topics into the store and open the channel.
    pub fn start(&self) {
        {
            let mut subs = self.push_subs.lock().unwrap_or_else(|e| e.into_inner());
            if subs.is_empty() {
                *subs = register_push_handlers(&self.connection, &self.store);
            }
        }
        self.connection.connect();
    }

    /// Tear the session down: closes the command scope, disconnects the
    /// channel, and detaches the push handlers.
    pub fn stop(&self) {
        self.scope.close();
        self.connection.disconnect();
        for sub in self
            .push_subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            sub.unsubscribe();
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    /// The session-wide cancellation scope, closed by [`Client::stop`].
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Subscribe the store to every server push topic. Payloads that fail to
/// decode are logged and dropped, like any other undecodable message.
pub fn register_push_handlers(connection: &Connection, store: &Store) -> Vec<Subscription> {
    let mut subs = Vec::new();

    // Partial transport updates: only pushed fields change.
    {
        let store = store.clone();
        subs.push(connection.subscribe(Topic::Transport, move |payload| {
            match serde_json::from_value::<TransportUpdate>(payload.clone()) {
                Ok(update) => {
                    store.apply(StatePatch::Transport(TransportPatch {
                        is_playing: update.is_playing,
                        position_beats: update.position_beats,
                        bpm: update.bpm,
                        time_signature: update.time_signature,
                        loop_enabled: update.loop_enabled,
                        loop_region: update.loop_region.map(Some),
                        error: None,
                    }));
                }
                Err(e) => warn!(error = %e, "invalid transport push payload"),
            }
        }));
    }

    // One new chat message, inserted in order with dedup.
    {
        let store = store.clone();
        subs.push(connection.subscribe(Topic::Chat, move |payload| {
            match serde_json::from_value::<ChatMessage>(payload.clone()) {
                Ok(message) => {
                    store.apply_with(|state| {
                        let mut chat = state.chat.clone();
                        chat.insert_message(StoredChatMessage::from(message));
                        StatePatch::Chat(ChatPatch {
                            messages: Some(chat.messages),
                            ..Default::default()
                        })
                    });
                }
                Err(e) => warn!(error = %e, "invalid chat push payload"),
            }
        }));
    }

    // Authoritative device list.
    {
        let store = store.clone();
        subs.push(connection.subscribe(Topic::Devices, move |payload| {
            match serde_json::from_value::<Vec<Device>>(payload.clone()) {
                Ok(devices) => {
                    store.apply(StatePatch::Devices(DevicesPatch {
                        devices: Some(devices),
                        ..Default::default()
                    }));
                }
                Err(e) => warn!(error = %e, "invalid devices push payload"),
            }
        }));
    }

    // Authoritative clip list.
    {
        let store = store.clone();
        subs.push(connection.subscribe(Topic::Timeline, move |payload| {
            match serde_json::from_value::<Vec<Clip>>(payload.clone()) {
                Ok(clips) => {
                    let mut stored: Vec<StoredClip> =
                        clips.into_iter().map(StoredClip::from).collect();
                    stored.sort_by_key(|c| c.order);
                    store.apply(StatePatch::Timeline(TimelinePatch {
                        clips: Some(stored),
                        loaded: Some(true),
                        ..Default::default()
                    }));
                }
                Err(e) => warn!(error = %e, "invalid timeline push payload"),
            }
        }));
    }

    subs
}
